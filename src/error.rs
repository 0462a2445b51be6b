use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// The two-level error model used across the pipeline: a small closed set of
/// kinds the Job Controller knows how to react to, plus an open `Structured`
/// bucket for everything else that only a human reading a YAML dump can act on.
#[derive(Error, Debug)]
pub enum Flaw {
    #[error("unauthorized")]
    Unauthorized,

    #[error("too many requests")]
    TooManyRequests,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("canceled")]
    Canceled,

    #[error("invalid link: {0}")]
    InvalidLink(String),

    #[error("a job is already running")]
    JobAlreadyRunning,

    #[error("authorization link expired before it was used")]
    AuthWaitTimeout,

    #[error("{message}")]
    Structured {
        message: String,
        context: BTreeMap<String, String>,
        #[source]
        source: Option<anyhow::Error>,
    },
}

impl Flaw {
    pub fn structured(message: impl Into<String>, source: anyhow::Error) -> Self {
        Flaw::Structured {
            message: message.into(),
            context: BTreeMap::new(),
            source: Some(source),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        if let Flaw::Structured { context, .. } = &mut self {
            context.insert(key.into(), value.to_string());
        }
        self
    }

    /// True when the Job Controller's retry loop should attempt the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Flaw::Unauthorized | Flaw::TooManyRequests | Flaw::DeadlineExceeded
        )
    }

    /// Renders this flaw as the YAML body attached to a terminal failure reply.
    pub fn to_yaml(&self) -> String {
        #[derive(serde::Serialize)]
        struct Dump {
            kind: String,
            message: String,
            context: BTreeMap<String, String>,
            source: Option<String>,
        }

        let dump = match self {
            Flaw::Structured {
                message,
                context,
                source,
            } => Dump {
                kind: "structured".to_string(),
                message: message.clone(),
                context: context.clone(),
                source: source.as_ref().map(|e| format!("{e:#}")),
            },
            other => Dump {
                kind: other.kind_name().to_string(),
                message: other.to_string(),
                context: BTreeMap::new(),
                source: None,
            },
        };
        serde_yaml::to_string(&dump).unwrap_or_else(|_| "error: failed to render flaw\n".into())
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Flaw::Unauthorized => "unauthorized",
            Flaw::TooManyRequests => "too_many_requests",
            Flaw::DeadlineExceeded => "deadline_exceeded",
            Flaw::Canceled => "canceled",
            Flaw::InvalidLink(_) => "invalid_link",
            Flaw::JobAlreadyRunning => "job_already_running",
            Flaw::AuthWaitTimeout => "auth_wait_timeout",
            Flaw::Structured { .. } => "structured",
        }
    }
}

/// Joins a cleanup-path error onto a primary error without discarding either.
pub fn join_errors(primary: Flaw, cleanup: anyhow::Error) -> Flaw {
    match primary {
        Flaw::Structured {
            message,
            mut context,
            source,
        } => {
            context.insert("cleanup_error".to_string(), format!("{cleanup:#}"));
            Flaw::Structured {
                message,
                context,
                source,
            }
        }
        other => Flaw::structured(other.to_string(), cleanup).with_context("primary", other),
    }
}
