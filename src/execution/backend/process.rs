//! Backend running modules in an external interpreter
//!
//! The module file is run once per site with the interpreter. The bound
//! input handles are written to its stdin as one JSON document:
//!
//! ```json
//! {"module": "smooth", "inputs": {"image": {"type": "Image", "value": {...}}}}
//! ```
//!
//! and the module prints a JSON object mapping output handle names to
//! values on stdout.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{take_outputs, BackendError, ExecutionBackend, Language};
use crate::execution::handles::{Handle, HandleDescriptor, HandleValues};
use crate::execution::pipeline::{ModuleSource, ModuleSpec};
use crate::subprocess::{ProcessCommand, ProcessError, SubprocessManager};

#[derive(Serialize)]
struct ModuleRequest<'a> {
    module: &'a str,
    inputs: &'a HandleValues,
}

pub struct ProcessBackend {
    language: Language,
    program: String,
    args: Vec<String>,
    subprocess: SubprocessManager,
    timeout: Option<Duration>,
    version: Option<String>,
    inputs: HandleValues,
    produced: HandleValues,
    last_module: String,
}

impl ProcessBackend {
    pub fn new(
        language: Language,
        program: String,
        args: Vec<String>,
        subprocess: SubprocessManager,
    ) -> Self {
        Self {
            language,
            program,
            args,
            subprocess,
            timeout: None,
            version: None,
            inputs: HandleValues::new(),
            produced: HandleValues::new(),
            last_module: String::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Interpreter version reported at startup
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn unavailable(&self, reason: impl Into<String>) -> BackendError {
        BackendError::Unavailable {
            language: self.language,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn language(&self) -> Language {
        self.language
    }

    async fn start(&mut self) -> Result<(), BackendError> {
        let command = ProcessCommand::new(&self.program, ["--version"]);
        let output = match self.subprocess.run(command).await {
            Ok(output) => output,
            Err(ProcessError::CommandNotFound(program)) => {
                return Err(self.unavailable(format!("interpreter \"{}\" not found", program)))
            }
            Err(e) => return Err(e.into()),
        };
        if !output.status.success() {
            return Err(self.unavailable(format!(
                "\"{} --version\" failed: {}",
                self.program,
                output.stderr.trim()
            )));
        }
        let version = output
            .stdout
            .lines()
            .chain(output.stderr.lines())
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
            .to_string();
        debug!("{} interpreter: {}", self.language, version);
        self.version = Some(version);
        Ok(())
    }

    fn bind(&mut self, inputs: Vec<Handle>) -> Result<(), BackendError> {
        self.inputs = inputs
            .into_iter()
            .map(|handle| (handle.descriptor.name, handle.value))
            .collect();
        Ok(())
    }

    async fn execute(&mut self, module: &ModuleSpec) -> Result<(), BackendError> {
        if self.version.is_none() {
            return Err(BackendError::NotStarted(self.language));
        }
        let ModuleSource::File(path) = &module.source else {
            return Err(self.unavailable(format!(
                "module \"{}\" has no source file",
                module.name
            )));
        };
        let request = serde_json::to_string(&ModuleRequest {
            module: &module.name,
            inputs: &self.inputs,
        })
        .map_err(|e| BackendError::ModuleFailed {
            module: module.name.clone(),
            message: format!("cannot serialize inputs: {}", e),
        })?;

        let args = self
            .args
            .iter()
            .cloned()
            .chain(std::iter::once(path.to_string_lossy().into_owned()));
        let command = ProcessCommand::new(&self.program, args)
            .in_dir(path.parent())
            .with_timeout(self.timeout)
            .with_stdin(request);
        let output = self.subprocess.run(command).await?;
        if !output.status.success() {
            return Err(BackendError::ModuleFailed {
                module: module.name.clone(),
                message: match output.status.code() {
                    Some(code) => format!("exit code {}: {}", code, output.stderr.trim()),
                    None => format!("{:?}: {}", output.status, output.stderr.trim()),
                },
            });
        }
        if !output.stderr.trim().is_empty() {
            warn!("module \"{}\": {}", module.name, output.stderr.trim());
        }

        self.produced = serde_json::from_str::<HandleValues>(output.stdout.trim()).map_err(
            |e| BackendError::InvalidOutput {
                module: module.name.clone(),
                message: e.to_string(),
            },
        )?;
        self.last_module = module.name.clone();
        Ok(())
    }

    fn collect(&mut self, outputs: &[HandleDescriptor]) -> Result<HandleValues, BackendError> {
        take_outputs(&self.last_module, &mut self.produced, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::handles::{HandleType, HandleValue, ModuleHandles};
    use std::path::PathBuf;

    fn module() -> ModuleSpec {
        ModuleSpec {
            name: "threshold".to_string(),
            source: ModuleSource::File(PathBuf::from("/modules/threshold.py")),
            language: Language::Python,
            handles: ModuleHandles::new(
                vec![HandleDescriptor::constant(
                    "level",
                    HandleType::Numeric,
                    serde_json::json!(3.0),
                )],
                vec![HandleDescriptor::keyed("mask", HandleType::Numeric, "mask")],
            ),
        }
    }

    fn started_backend() -> (ProcessBackend, crate::subprocess::MockProcessRunner) {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("python3")
            .with_args(|args| args == ["--version"])
            .returns_stdout("Python 3.12.1\n")
            .finish();
        let backend = ProcessBackend::new(
            Language::Python,
            "python3".to_string(),
            vec!["-u".to_string()],
            subprocess,
        );
        (backend, mock)
    }

    #[tokio::test]
    async fn test_execute_sends_inputs_and_parses_outputs() {
        let (mut backend, mut mock) = started_backend();
        mock.expect_command("python3")
            .with_args(|args| args == ["-u", "/modules/threshold.py"])
            .responds_with(|stdin| {
                let request: serde_json::Value = serde_json::from_str(stdin).unwrap();
                let level = request["inputs"]["level"]["value"].as_f64().unwrap();
                format!(r#"{{"mask": {{"type": "Numeric", "value": {}}}}}"#, level + 1.0)
            })
            .finish();
        backend.start().await.unwrap();
        assert_eq!(backend.version(), Some("Python 3.12.1"));

        let module = module();
        backend
            .bind(vec![Handle {
                descriptor: module.handles.input[0].clone(),
                value: HandleValue::Numeric(3.0),
            }])
            .unwrap();
        backend.execute(&module).await.unwrap();
        let outputs = backend.collect(&module.handles.output).unwrap();
        assert_eq!(outputs["mask"], HandleValue::Numeric(4.0));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_the_module() {
        let (mut backend, mut mock) = started_backend();
        mock.expect_command("python3")
            .with_args(|args| args.len() == 2)
            .returns_exit_code(1)
            .returns_stderr("ZeroDivisionError")
            .finish();
        backend.start().await.unwrap();
        let err = backend.execute(&module()).await.unwrap_err();
        match err {
            BackendError::ModuleFailed { module, message } => {
                assert_eq!(module, "threshold");
                assert!(message.contains("ZeroDivisionError"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_output_is_invalid() {
        let (mut backend, mut mock) = started_backend();
        mock.expect_command("python3")
            .with_args(|args| args.len() == 2)
            .returns_stdout("{}")
            .finish();
        backend.start().await.unwrap();
        let module = module();
        backend.execute(&module).await.unwrap();
        let err = backend.collect(&module.handles.output).unwrap_err();
        assert!(matches!(err, BackendError::InvalidOutput { .. }));
    }

    #[tokio::test]
    async fn test_module_runs_are_bounded_by_timeout() {
        let (backend, mut mock) = started_backend();
        let mut backend = backend.with_timeout(Some(Duration::from_secs(90)));
        mock.expect_command("python3")
            .with_args(|args| args.len() == 2)
            .returns_stdout(r#"{"mask": {"type": "Numeric", "value": 1.0}}"#)
            .finish();
        backend.start().await.unwrap();
        backend.execute(&module()).await.unwrap();

        let history = mock.get_call_history();
        assert_eq!(history[0].timeout, None);
        assert_eq!(history[1].timeout, Some(Duration::from_secs(90)));
        assert_eq!(
            history[1].working_dir.as_deref(),
            Some(std::path::Path::new("/modules"))
        );
    }

    #[tokio::test]
    async fn test_execute_before_start() {
        let (mut backend, _mock) = started_backend();
        let err = backend.execute(&module()).await.unwrap_err();
        assert!(matches!(err, BackendError::NotStarted(Language::Python)));
    }
}
