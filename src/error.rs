use thiserror::Error;

/// Failures of the document store itself.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database request failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("document {doc_id} has an unexpected shape")]
    Decode {
        doc_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot file {path} could not be read or written")]
    Snapshot {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot file {path} is not valid JSON")]
    SnapshotFormat {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum QuizError {
    #[error("could not load data from the store: {0}")]
    StoreRead(#[source] StoreError),

    #[error("could not save to the store: {0}")]
    StoreWrite(#[source] StoreError),

    #[error("{email} is not a {domain} account; you have been signed out")]
    IdentityDomainRejected { email: String, domain: String },

    #[error("sign-in credential rejected: {0}")]
    InvalidCredential(String),

    #[error("sign in before submitting answers")]
    NotSignedIn,

    #[error("week {week_no}: question {section} is mandatory and has no answer")]
    MissingMandatoryAnswer { week_no: i64, section: usize },

    #[error("week {week_no} has only {questions} questions but {answers} answers were given")]
    UnknownQuestion {
        week_no: i64,
        questions: usize,
        answers: usize,
    },

    #[error("week {0} does not exist or is not open")]
    WeekNotFound(i64),

    #[error("invalid week: {0}")]
    InvalidWeek(String),
}
