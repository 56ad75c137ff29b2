use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// A captured document could not be parsed as JSON
    #[error("Invalid JSON in {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// One frame of an event-stream response was not valid JSON
    #[error("Malformed event-stream frame {index}: {source}")]
    MalformedFrame {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Response body was neither a JSON document nor an event stream with data frames
    #[error("Response body is neither JSON nor an event stream with data frames")]
    InvalidEventStream,

    /// The message-aware token counter has no accounting rules for this model
    #[error("Token counting from messages is not implemented for model {model}")]
    UnsupportedModel { model: String },

    /// The BPE tokenizer could not be loaded
    #[error("Tokenizer unavailable: {message}")]
    Tokenizer { message: String },

    /// Transport failure talking to the logging endpoint
    #[error("Failed to deliver usage record: {0}")]
    Delivery(#[from] reqwest::Error),

    /// The logging endpoint answered with a non-success status
    #[error("Logging endpoint rejected usage record with status {status}")]
    Rejected { status: u16 },

    /// Delivery tasks need a tokio runtime to be spawned on
    #[error("No tokio runtime available to deliver usage records")]
    NoRuntime,

    /// Configuration loaded but failed validation
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] Box<figment::Error>),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl Error {
    /// Wraps a serde_json error with the name of the document being parsed.
    pub(crate) fn json(context: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| Error::Json { context, source }
    }

    /// Whether the exchange was dropped before anything was sent over the network.
    pub fn is_normalization_error(&self) -> bool {
        matches!(
            self,
            Error::Json { .. }
                | Error::MalformedFrame { .. }
                | Error::InvalidEventStream
                | Error::UnsupportedModel { .. }
                | Error::Tokenizer { .. }
        )
    }
}
