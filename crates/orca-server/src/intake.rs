//! Worker intake loop.
//!
//! Requests arrive as JSON lines (`{"subject_id": "..."}`). Each request runs
//! on its own task; results are written back as JSON lines in completion
//! order. Reading stops at end of input or once shutdown is requested.

use orca_core::{Coordinator, Error, SessionRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct IntakeRequest {
    pub subject_id: String,
}

/// One output line.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntakeResponse {
    Ok {
        subject_id: String,
        session: Box<SessionRecord>,
    },
    Error {
        subject_id: Option<String>,
        error: ErrorBody,
    },
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
}

impl ErrorBody {
    fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::ConsentDenied { .. } => "consent_denied",
            Error::Store(_) => "store",
            Error::ShuttingDown => "shutting_down",
            Error::Saturated { .. } => "saturated",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::Other(_) => "other",
        };
        let missing = match err {
            Error::ConsentDenied { missing, .. } => missing.clone(),
            _ => Vec::new(),
        };
        Self {
            kind,
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            missing,
        }
    }
}

impl IntakeResponse {
    pub(crate) fn from_result(subject_id: String, result: orca_core::Result<SessionRecord>) -> Self {
        match result {
            Ok(record) => Self::Ok {
                subject_id,
                session: Box::new(record),
            },
            Err(err) => Self::Error {
                subject_id: Some(subject_id),
                error: ErrorBody::from_error(&err),
            },
        }
    }

    fn invalid_request(message: String) -> Self {
        Self::Error {
            subject_id: None,
            error: ErrorBody {
                kind: "invalid_request",
                message,
                recoverable: false,
                missing: Vec::new(),
            },
        }
    }
}

/// Counters for one intake run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntakeStats {
    pub accepted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub invalid: usize,
}

/// Read requests from `reader` until end of input or shutdown and write one
/// response line per request to `writer`.
///
/// Sessions still running when reading stops are awaited before returning.
pub async fn run<R, W>(
    coordinator: Arc<Coordinator>,
    reader: R,
    writer: &mut W,
) -> anyhow::Result<IntakeStats>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let lifecycle = coordinator.lifecycle();
    let mut lines = reader.lines();
    let mut sessions: JoinSet<IntakeResponse> = JoinSet::new();
    let mut stats = IntakeStats::default();

    loop {
        tokio::select! {
            _ = lifecycle.shutdown_requested() => {
                info!(in_flight = sessions.len(), "Shutdown requested, intake closed");
                break;
            }
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                let response = joined?;
                write_response(writer, &response, &mut stats).await?;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!(in_flight = sessions.len(), "Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<IntakeRequest>(&line) {
                    Ok(request) => {
                        stats.accepted += 1;
                        debug!(subject_id = %request.subject_id, "Accepted request");
                        let coordinator = coordinator.clone();
                        sessions.spawn(async move {
                            let result = coordinator.run_session(&request.subject_id).await;
                            IntakeResponse::from_result(request.subject_id, result)
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Invalid request line");
                        stats.invalid += 1;
                        let response = IntakeResponse::invalid_request(e.to_string());
                        write_line(writer, &response).await?;
                    }
                }
            }
        }
    }

    while let Some(joined) = sessions.join_next().await {
        let response = joined?;
        write_response(writer, &response, &mut stats).await?;
    }

    Ok(stats)
}

async fn write_response<W>(
    writer: &mut W,
    response: &IntakeResponse,
    stats: &mut IntakeStats,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match response {
        IntakeResponse::Ok { .. } => stats.succeeded += 1,
        IntakeResponse::Error { .. } => stats.failed += 1,
    }
    write_line(writer, response).await
}

/// Serialize one response as a JSON line and flush it.
pub async fn write_line<W, T>(writer: &mut W, value: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
