use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VmError {
    #[error("base image '{name}' is not available locally")]
    #[diagnostic(help("fetch it first with `vmlab image pull {name}` or register a file with `vmlab image add`"))]
    ImageNotFound { name: String },

    #[error("VM '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("VM '{name}' not found")]
    NotFound { name: String },

    #[error("cannot {operation} VM '{name}' while it is {status}")]
    InvalidState {
        name: String,
        operation: String,
        status: String,
    },

    #[error("no SSH credentials available for VM '{name}'")]
    #[diagnostic(help("tried: {tried}"))]
    NoCredentialsAvailable { name: String, tried: String },

    #[error("failed to launch hypervisor for VM '{name}': {message}")]
    HypervisorLaunchFailed { name: String, message: String },

    #[error("VM '{name}' did not become ready: {message}")]
    #[diagnostic(help("{report}"))]
    ReadinessTimeout {
        name: String,
        message: String,
        report: String,
    },

    #[error("initialization of VM '{name}' was canceled by caller")]
    #[diagnostic(help("{report}"))]
    CanceledByCaller { name: String, report: String },

    #[error("disk operation failed: {context}")]
    #[diagnostic(help("{output}"))]
    DiskOperationFailed { context: String, output: String },

    #[error("terminal multiplexer error: {message}")]
    SessionError { message: String },

    #[error("SSH error: {message}")]
    Ssh { message: String },

    #[error("failed to download image: {message}")]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("corrupt state file {path}: {message}")]
    StateFile { path: String, message: String },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl VmError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        VmError::Io {
            context: context.into(),
            source,
        }
    }
}
