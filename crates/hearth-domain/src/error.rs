use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("trait '{0}' must be an object")]
    TraitNotObject(String),

    #[error("trait '{0}' cannot be redefined")]
    TraitConflict(String),

    #[error("trait '{0}' is undefined")]
    UnknownTrait(String),

    #[error("component '{name}' already exists at path '{path}'")]
    ComponentExists { path: String, name: String },

    #[error("component '{name}' does not exist at '{path}'")]
    ComponentNotFound { path: String, name: String },

    #[error("invalid component path '{path}': {message}")]
    BadPath { path: String, message: String },

    #[error("element '{0}' is an array, index required")]
    IndexRequired(String),

    #[error("element '{0}' is not an array")]
    NotAnArray(String),

    #[error("element '{name}' does not contain item #{index}")]
    BadIndex { name: String, index: usize },

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("command name is missing")]
    CommandNameMissing,

    #[error("invalid value for '{name}': {message}")]
    InvalidValue { name: String, message: String },

    #[error("required property '{0}' is missing")]
    RequiredMissing(String),

    #[error("property '{0}' is not defined in the schema")]
    UndefinedProperty(String),

    #[error("value of '{name}' is not in the allowed set")]
    NotInEnum { name: String },

    #[error("user role '{actual}' is less than minimal role '{required}'")]
    AccessDenied { actual: String, required: String },

    #[error("no component supports trait '{trait_name}' required by command '{command}'")]
    UnroutedCommand {
        command: String,
        trait_name: String,
    },

    #[error("component '{path}' does not support trait '{trait_name}'")]
    TraitNotSupported { path: String, trait_name: String },

    #[error("state switch impossible: '{from}' -> '{to}'")]
    InvalidStateTransition { from: String, to: String },

    #[error("command has been removed from the queue")]
    CommandDestroyed,

    #[error("command '{0}' is already in the queue")]
    DuplicateCommand(String),

    #[error("handler for '{component}'/'{command}' is already registered")]
    HandlerExists { component: String, command: String },

    #[error("specific handlers are not allowed after the default one")]
    HandlerAfterDefault,

    #[error("expected a JSON object")]
    ObjectExpected,
}

impl DomainError {
    /// Stable wire code for this error, used in command errors and Privet
    /// responses.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::TraitNotObject(_) => "typeMismatch",
            DomainError::TraitConflict(_) => "conflict",
            DomainError::UnknownTrait(_) => "unknownTrait",
            DomainError::ComponentExists { .. } => "alreadyExists",
            DomainError::ComponentNotFound { .. } => "notFound",
            DomainError::BadPath { .. } => "badPath",
            DomainError::IndexRequired(_) => "typeMismatch",
            DomainError::NotAnArray(_) => "typeMismatch",
            DomainError::BadIndex { .. } => "badIndex",
            DomainError::UnknownCommand(_) => "invalidCommandName",
            DomainError::CommandNameMissing => "invalidCommandName",
            DomainError::InvalidValue { .. } => "invalidParameterValue",
            DomainError::RequiredMissing(_) => "parameterMissing",
            DomainError::UndefinedProperty(_) => "propertyNotDefined",
            DomainError::NotInEnum { .. } => "invalidParameterValue",
            DomainError::AccessDenied { .. } => "accessDenied",
            DomainError::UnroutedCommand { .. } => "unroutedCommand",
            DomainError::TraitNotSupported { .. } => "traitNotSupported",
            DomainError::InvalidStateTransition { .. } => "invalidState",
            DomainError::CommandDestroyed => "commandDestroyed",
            DomainError::DuplicateCommand(_) => "duplicateCommand",
            DomainError::HandlerExists { .. } => "handlerExists",
            DomainError::HandlerAfterDefault => "handlerExists",
            DomainError::ObjectExpected => "typeMismatch",
        }
    }
}

/// Structured error attached to a failed or aborted command. Mirrors the
/// shape sent to the cloud: domain, code, human message and an optional
/// nested cause.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ErrorInfo {
    pub domain: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    pub fn new(
        domain: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ErrorInfo {
            domain: domain.into(),
            code: code.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: ErrorInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl From<&DomainError> for ErrorInfo {
    fn from(e: &DomainError) -> Self {
        ErrorInfo::new("commands", e.code(), e.to_string())
    }
}
