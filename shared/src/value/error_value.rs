use super::Value;

/// Built-in error classes an error value can be reconstructed as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
    EvalError,
    UriError,
    AggregateError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::EvalError => "EvalError",
            ErrorKind::UriError => "URIError",
            ErrorKind::AggregateError => "AggregateError",
        }
    }

    /// Unknown class names fall back to the generic `Error`.
    pub fn from_type_name(name: &str) -> ErrorKind {
        match name {
            "TypeError" => ErrorKind::TypeError,
            "RangeError" => ErrorKind::RangeError,
            "ReferenceError" => ErrorKind::ReferenceError,
            "SyntaxError" => ErrorKind::SyntaxError,
            "EvalError" => ErrorKind::EvalError,
            "URIError" => ErrorKind::UriError,
            "AggregateError" => ErrorKind::AggregateError,
            _ => ErrorKind::Error,
        }
    }
}

/// Immutable error payload.
#[derive(Clone, Debug)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub cause: Option<Value>,
    pub errors: Option<Vec<Value>>,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: kind.as_str().to_string(),
            message: message.into(),
            stack: None,
            cause: None,
            errors: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<Value>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_errors(mut self, errors: Vec<Value>) -> Self {
        self.errors = Some(errors);
        self
    }
}
