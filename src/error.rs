use thiserror::Error;

/// Crate-wide error type. Display strings double as the protocol reason
/// strings sent back to clients as `-ERR '<reason>'`, so they must stay
/// stable.
#[derive(Debug, Error)]
pub enum JetStreamError {
    #[error("jetstream not enabled")]
    NotEnabled,
    #[error("jetstream already enabled")]
    AlreadyEnabled,
    #[error("jetstream not enabled for account")]
    NotEnabledForAccount,
    #[error("jetstream already enabled for account")]
    AlreadyEnabledForAccount,
    #[error("jetstream restricted to single server mode")]
    StandaloneRequired,

    #[error("insufficient memory resources available")]
    InsufficientMemory,
    #[error("insufficient storage resources available")]
    InsufficientStorage,
    #[error("maximum number of streams reached")]
    MaxStreamsReached,
    #[error("maximum consumers exceeds account limit")]
    MaxConsumersExceedsAccount,
    #[error("maximum consumers limit reached")]
    MaxConsumersReached,
    #[error("replicas setting of {0} not allowed")]
    ReplicasNotSupported(usize),

    #[error("invalid stream name")]
    InvalidStreamName,
    #[error("invalid subject {0:?} in stream config")]
    InvalidStreamSubject(String),
    #[error("stream name already in use")]
    StreamNameInUse,
    #[error("stream not found")]
    StreamNotFound,

    #[error("durable name can not contain '.', '*', '>'")]
    InvalidConsumerName,
    #[error("consumer deliver subject has wildcards")]
    DeliverSubjectWildcard,
    #[error("consumer already exists")]
    ConsumerNameInUse,
    #[error("consumer not found")]
    ConsumerNotFound,

    #[error("invalid template name")]
    InvalidTemplateName,
    #[error("template config name should be empty")]
    TemplateNameNotEmpty,
    #[error("template with name {0:?} already exists")]
    TemplateNameInUse(String),
    #[error("no template found")]
    TemplateNotFound,

    #[error("could not create storage directory - {0}")]
    StorageDirCreate(std::io::Error),
    #[error("storage directory is not a directory")]
    StorageDirNotADirectory,
    #[error("storage directory is not writable")]
    StorageDirNotWritable,
    #[error("storage directory migration would overwrite {0:?}")]
    StorageMigrationCollision(String),

    #[error("error setting up internal jetstream subscriptions: {0}")]
    Subscription(#[source] BusError),
    #[error("error setting up jetstream service exports: {0}")]
    ServiceExport(#[source] BusError),
    #[error("error setting up jetstream service imports for account: {0}")]
    ServiceImport(#[source] BusError),
    #[error("error deleting template from store: {0}")]
    TemplateStoreDelete(#[source] Box<JetStreamError>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the broker collaborator interfaces.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("no system account configured")]
    NoSystemAccount,
    #[error("invalid subscription subject {0:?}")]
    InvalidSubject(String),
    #[error("client closed")]
    ClientClosed,
}

pub type Result<T> = std::result::Result<T, JetStreamError>;
