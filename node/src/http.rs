//! HTTP/JSON adapters for the ticket source, randomness oracle and ledger.
//!
//! Endpoints, relative to each service's base URL:
//! - `GET  rounds/{round_id}/tickets?as_of_ms={ms}` -> `[Ticket]`
//! - `POST randomness` (`RandomnessRequest`) -> `RandomnessResponse`
//! - `POST transfers` (`TransferRequest`) -> `TransferReceipt`
//! - `GET  transfers/{idempotency_key}` -> `TransferReceipt`, 404 if unknown
//!
//! Adapters never retry; they only classify failures into [`ServiceError`]
//! so the engine can decide.

use drawsettle_execution::{
    Ledger, RandomnessRequest, RandomnessResponse, RandomnessService, ServiceError, TicketSource,
    TransferReceipt, TransferRequest,
};
use drawsettle_types::{RoundId, Ticket};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Header carrying the transfer's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}

/// Base URLs are joined against, so they must end in `/`.
fn normalize_base(mut base_url: Url) -> Url {
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }
    base_url
}

fn endpoint(base_url: &Url, path: &str) -> Result<Url, ServiceError> {
    base_url
        .join(path)
        .map_err(|err| ServiceError::Rejected(format!("invalid endpoint {path}: {err}")))
}

fn classify_send_error(err: reqwest::Error, timeout: Duration) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Timeout(timeout)
    } else if err.is_decode() {
        ServiceError::Malformed(err.to_string())
    } else {
        ServiceError::Unavailable(err.to_string())
    }
}

/// Map a non-success status to a [`ServiceError`].
fn classify_status(status: StatusCode, body: String, timeout: Duration) -> ServiceError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ServiceError::Timeout(timeout),
        status if status.is_server_error() => ServiceError::Unavailable(format!("{status}: {body}")),
        status => ServiceError::Rejected(format!("{status}: {body}")),
    }
}

async fn check_status(response: Response, timeout: Duration) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, body, timeout))
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
    response
        .json::<T>()
        .await
        .map_err(|err| ServiceError::Malformed(err.to_string()))
}

pub struct HttpTicketSource {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpTicketSource {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: normalize_base(base_url),
            timeout,
        })
    }
}

impl TicketSource for HttpTicketSource {
    async fn list_tickets(
        &self,
        round_id: RoundId,
        as_of_ms: u64,
    ) -> Result<Vec<Ticket>, ServiceError> {
        let url = endpoint(&self.base_url, &format!("rounds/{round_id}/tickets"))?;
        let response = self
            .client
            .get(url)
            .query(&[("as_of_ms", as_of_ms)])
            .send()
            .await
            .map_err(|err| classify_send_error(err, self.timeout))?;
        let tickets: Vec<Ticket> = decode(check_status(response, self.timeout).await?).await?;
        debug!(round_id, tickets = tickets.len(), "fetched tickets");
        Ok(tickets)
    }
}

pub struct HttpRandomness {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpRandomness {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: normalize_base(base_url),
            timeout,
        })
    }
}

impl RandomnessService for HttpRandomness {
    async fn request_random(
        &self,
        request: &RandomnessRequest,
    ) -> Result<RandomnessResponse, ServiceError> {
        let url = endpoint(&self.base_url, "randomness")?;
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|err| classify_send_error(err, self.timeout))?;
        decode(check_status(response, self.timeout).await?).await
    }
}

/// Ledger client. Transfers are throttled to a fixed rate; lookups are not.
pub struct HttpLedger {
    client: Client,
    base_url: Url,
    timeout: Duration,
    api_token: Option<String>,
    limiter: DefaultDirectRateLimiter,
    complete_lookup: bool,
}

impl HttpLedger {
    pub fn new(
        base_url: Url,
        timeout: Duration,
        api_token: Option<String>,
        rate_per_second: NonZeroU32,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: normalize_base(base_url),
            timeout,
            api_token,
            limiter: RateLimiter::direct(Quota::per_second(rate_per_second)),
            complete_lookup: false,
        })
    }

    /// Trust a 404 from the lookup endpoint as proof that a transfer was
    /// never applied.
    pub fn with_complete_lookup(mut self, complete: bool) -> Self {
        self.complete_lookup = complete;
        self
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

impl Ledger for HttpLedger {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, ServiceError> {
        self.limiter.until_ready().await;
        let url = endpoint(&self.base_url, "transfers")?;
        let response = self
            .authorize(self.client.post(url))
            .header(IDEMPOTENCY_KEY_HEADER, &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|err| classify_send_error(err, self.timeout))?;
        decode(check_status(response, self.timeout).await?).await
    }

    async fn lookup_transfer(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<TransferReceipt>, ServiceError> {
        let url = endpoint(&self.base_url, &format!("transfers/{idempotency_key}"))?;
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|err| classify_send_error(err, self.timeout))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(check_status(response, self.timeout).await?)
            .await
            .map(Some)
    }

    fn lookup_is_complete(&self) -> bool {
        self.complete_lookup
    }
}
