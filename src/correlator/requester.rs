//! Requester side of the exchange.

use backon::BackoffBuilder;
use tracing::{debug, info, warn};

use super::{Connector, PendingExchange};
use crate::envelope::{Envelope, Headers, Payload};
use crate::error::{Error, Result, Stage};
use crate::topology::Destination;
use crate::utils::retry::exchange_backoff;

/// Where one attempt of an exchange stands.
#[derive(Debug)]
enum RequestState {
    Requesting,
    AwaitingAck(PendingExchange),
    Confirming { ack: Envelope },
    AwaitingResult(PendingExchange),
    Done(Payload),
}

impl Connector {
    /// Issue `command` with `payload` and return the responder's result.
    pub async fn request(&self, command: &str, payload: Payload) -> Result<Payload> {
        self.request_with(command, payload, Ok).await
    }

    /// Issue `command` and project the result with `project`.
    ///
    /// A timeout, broker error, or projection failure restarts the whole
    /// exchange with a fresh checksum, up to `max_retries` times. The error of
    /// the last attempt is surfaced inside [`Error::RetriesExhausted`].
    pub async fn request_with<T, F>(&self, command: &str, payload: Payload, project: F) -> Result<T>
    where
        F: Fn(Payload) -> Result<T>,
    {
        let mut backoff = exchange_backoff(&self.exchange).build();
        let mut attempt: u32 = 0;

        loop {
            let outcome = match self.attempt(command, payload.clone(), attempt).await {
                Ok(result) => project(result),
                Err(e) => Err(e),
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            match backoff.next() {
                Some(delay) => {
                    warn!(
                        command = %command,
                        attempt = attempt + 1,
                        max_retries = self.exchange.max_retries,
                        backoff_ms = %delay.as_millis(),
                        error = %error,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    warn!(
                        command = %command,
                        attempts = attempt + 1,
                        error = %error,
                        "Request failed, giving up"
                    );
                    return Err(Error::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(error),
                    });
                }
            }
        }
    }

    /// One attempt, driven through the request states.
    async fn attempt(&self, command: &str, payload: Payload, attempt: u32) -> Result<Payload> {
        let retries_remaining = self.exchange.max_retries.saturating_sub(attempt);
        let mut state = RequestState::Requesting;

        loop {
            state = match state {
                RequestState::Requesting => {
                    let headers = Headers::command(command).with_attempt(attempt);
                    let request = self
                        .messenger
                        .publish(&Destination::Command, &headers, payload.clone())
                        .await?;
                    debug!(command = %command, checksum = %request, attempt, "Requested");
                    RequestState::AwaitingAck(PendingExchange::new(
                        request,
                        self.exchange.ack_timeout(),
                        retries_remaining,
                    ))
                }
                RequestState::AwaitingAck(pending) => {
                    let ack = self.await_reply(&pending, Stage::AwaitingAck).await?;
                    debug!(
                        request = %pending.request,
                        responder = %ack.uuid(),
                        "Request claimed"
                    );
                    RequestState::Confirming { ack }
                }
                RequestState::Confirming { ack } => {
                    let confirmation = self
                        .messenger
                        .publish_response(&ack.uuid(), &ack.checksum(), Payload::new())
                        .await?;
                    RequestState::AwaitingResult(PendingExchange::new(
                        confirmation,
                        self.exchange.result_timeout(),
                        retries_remaining,
                    ))
                }
                RequestState::AwaitingResult(pending) => {
                    let result = self.await_reply(&pending, Stage::AwaitingResult).await?;
                    RequestState::Done(result.payload())
                }
                RequestState::Done(result) => {
                    info!(command = %command, attempt, "Request completed");
                    return Ok(result);
                }
            };
        }
    }
}
