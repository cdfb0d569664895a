use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Argument prefixes whose values never reach the logs
const REDACTED_FLAGS: &[&str] = &["--docker-password="];

/// Failure of a cluster command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to execute kubectl: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("kubectl {command} exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl CommandError {
    pub fn stderr(&self) -> &str {
        match self {
            Self::Spawn(_) => "",
            Self::Failed { stderr, .. } => stderr,
        }
    }

    /// The object being created is already present on the cluster
    pub fn is_already_exists(&self) -> bool {
        let stderr = self.stderr();
        stderr.contains("AlreadyExists") || stderr.contains("already exists")
    }

    /// The object being deleted or labelled is not present on the cluster
    pub fn is_not_found(&self) -> bool {
        let stderr = self.stderr();
        stderr.contains("NotFound") || stderr.contains("not found")
    }
}

/// Failure conditions a call site accepts as success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tolerate {
    Nothing,
    AlreadyExists,
    NotFound,
}

impl Tolerate {
    pub fn matches(self, err: &CommandError) -> bool {
        match self {
            Self::Nothing => false,
            Self::AlreadyExists => err.is_already_exists(),
            Self::NotFound => err.is_not_found(),
        }
    }
}

/// Trait for executing cluster commands (allows mocking in tests)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Kubectl: Send + Sync {
    /// Run `kubectl <args>`, optionally feeding `stdin`, and return stdout
    async fn run(&self, args: Vec<String>, stdin: Option<String>) -> Result<String, CommandError>;
}

/// Real kubectl runner authenticated with a fixed kubeconfig
#[derive(Debug, Clone)]
pub struct KubectlCli {
    kubeconfig: PathBuf,
}

impl KubectlCli {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
        }
    }
}

#[async_trait]
impl Kubectl for KubectlCli {
    async fn run(&self, args: Vec<String>, stdin: Option<String>) -> Result<String, CommandError> {
        let command = redact(&args);
        tracing::debug!(%command, "Executing kubectl");

        let mut child = Command::new("kubectl")
            .arg("--kubeconfig")
            .arg(&self.kubeconfig)
            .args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(CommandError::Failed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

fn redact(args: &[String]) -> String {
    args.iter()
        .map(|arg| match REDACTED_FLAGS.iter().find(|flag| arg.starts_with(*flag)) {
            Some(flag) => format!("{}***", flag),
            None => arg.clone(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// A manifest to hand to kubectl, either on disk or rendered in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    Path(PathBuf),
    Inline(String),
}

/// ManifestApplier wraps the verbs the charm issues against the cluster
pub struct ManifestApplier<K> {
    kubectl: K,
}

impl<K: Kubectl> ManifestApplier<K> {
    pub fn new(kubectl: K) -> Self {
        Self { kubectl }
    }

    pub async fn execute(&self, args: &[&str]) -> Result<String, CommandError> {
        let args = args.iter().map(|a| a.to_string()).collect();
        self.kubectl.run(args, None).await
    }

    /// `kubectl apply -f <manifest>`
    pub async fn apply(&self, manifest: &Manifest, namespace: Option<&str>) -> Result<String, CommandError> {
        self.with_manifest("apply", manifest, namespace).await
    }

    /// `kubectl create -f <manifest>`
    pub async fn create(&self, manifest: &Manifest, namespace: Option<&str>) -> Result<String, CommandError> {
        self.with_manifest("create", manifest, namespace).await
    }

    pub async fn create_namespace(&self, name: &str) -> Result<String, CommandError> {
        self.execute(&["create", "namespace", name]).await
    }

    pub async fn delete(&self, kind: &str, name: &str, namespace: &str) -> Result<String, CommandError> {
        self.execute(&["delete", kind, name, "-n", namespace]).await
    }

    pub async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<String, CommandError> {
        let label = format!("{}={}", key, value);
        self.execute(&["label", "node", node, &label, "--overwrite"]).await
    }

    async fn with_manifest(
        &self,
        verb: &str,
        manifest: &Manifest,
        namespace: Option<&str>,
    ) -> Result<String, CommandError> {
        let mut args = vec![verb.to_string()];
        if let Some(ns) = namespace {
            args.extend(["-n".to_string(), ns.to_string()]);
        }
        let stdin = match manifest {
            Manifest::Path(path) => {
                args.extend(["-f".to_string(), path.display().to_string()]);
                None
            }
            Manifest::Inline(content) => {
                args.extend(["-f".to_string(), "-".to_string()]);
                Some(content.clone())
            }
        };
        self.kubectl.run(args, stdin).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn failed(stderr: &str) -> CommandError {
        CommandError::Failed {
            command: "create".to_string(),
            code: Some(1),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_tolerate_allow_list() {
        let exists = failed(r#"Error from server (AlreadyExists): namespaces "tigera-operator" already exists"#);
        let missing = failed(r#"Error from server (NotFound): secrets "tigera-pull-secret" not found"#);
        let forbidden = failed(r#"Error from server (Forbidden): namespaces is forbidden: User "x" cannot create"#);

        assert!(Tolerate::AlreadyExists.matches(&exists));
        assert!(!Tolerate::AlreadyExists.matches(&missing));
        assert!(Tolerate::NotFound.matches(&missing));
        assert!(!Tolerate::AlreadyExists.matches(&forbidden));
        assert!(!Tolerate::NotFound.matches(&forbidden));
        assert!(!Tolerate::Nothing.matches(&exists));
    }

    #[test]
    fn test_redact_password() {
        let args = vec![
            "create".to_string(),
            "--docker-username=user".to_string(),
            "--docker-password=hunter2".to_string(),
        ];
        assert_eq!(redact(&args), "create --docker-username=user --docker-password=***");
    }

    #[tokio::test]
    async fn test_apply_inline_uses_stdin() {
        let mut mock = MockKubectl::new();
        mock.expect_run()
            .withf(|args, stdin| {
                *args == ["apply", "-n", "calico-system", "-f", "-"] && stdin.as_deref() == Some("kind: ConfigMap")
            })
            .times(1)
            .returning(|_, _| Ok("configmap/bgp-layout created".to_string()));

        let applier = ManifestApplier::new(mock);
        let output = applier
            .apply(&Manifest::Inline("kind: ConfigMap".to_string()), Some("calico-system"))
            .await;
        assert_eq!(assert_ok!(output), "configmap/bgp-layout created");
    }

    #[tokio::test]
    async fn test_create_from_path() {
        let mut mock = MockKubectl::new();
        mock.expect_run()
            .withf(|args, stdin| *args == ["create", "-f", "/resources/tigera-operator.yaml"] && stdin.is_none())
            .times(1)
            .returning(|_, _| Err(failed("AlreadyExists")));

        let applier = ManifestApplier::new(mock);
        let err = assert_err!(
            applier
                .create(&Manifest::Path(PathBuf::from("/resources/tigera-operator.yaml")), None)
                .await
        );
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_label_node_overwrites() {
        let mut mock = MockKubectl::new();
        mock.expect_run()
            .withf(|args, _| *args == ["label", "node", "k8s-node-1", "rack=rack-1", "--overwrite"])
            .times(1)
            .returning(|_, _| Ok("node/k8s-node-1 labeled".to_string()));

        let applier = ManifestApplier::new(mock);
        assert_ok!(applier.label_node("k8s-node-1", "rack", "rack-1").await);
    }
}
