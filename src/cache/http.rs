//! Browser-level caching through conditional GET.
//!
//! Validators are derived from entity timestamps, never from rendered
//! bytes, so a `304 Not Modified` costs a few backend reads and no render.

use std::future::Future;
use std::iter;

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{
            CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
        },
    },
    response::{IntoResponse, Response},
};
use futures::future::try_join_all;
use sha2::{Digest, Sha256};
use time::{
    OffsetDateTime, PrimitiveDateTime, UtcOffset, format_description::BorrowedFormatItem,
    macros::format_description,
};
use tracing::{debug, warn};

use crate::domain::entities::EntityKey;

use super::error::{BackendError, RenderError};
use super::keys::SettingsHash;
use super::render::{RenderCache, Rendered};
use super::timestamps::Timestamp;

const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);
const CACHE_CONTROL_VALUE: &str = "private, no-cache";

/// `ETag` and `Last-Modified` for one page as seen by one viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validators {
    latest: Timestamp,
    etag: String,
}

impl Validators {
    /// Builds validators from the timestamps of everything the page shows.
    /// The viewer is part of the ETag so two accounts sharing a browser never
    /// share a cached page. Returns `None` without timestamps.
    pub fn new<I>(timestamps: I, viewer: &str) -> Option<Self>
    where
        I: IntoIterator<Item = Timestamp>,
    {
        let latest = timestamps.into_iter().max()?;
        let mut hasher = Sha256::new();
        hasher.update(latest.as_micros().to_string().as_bytes());
        hasher.update(b"\x03");
        hasher.update(viewer.as_bytes());
        let etag = format!("\"{}\"", hex::encode(hasher.finalize()));
        Some(Self { latest, etag })
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn latest(&self) -> Timestamp {
        self.latest
    }

    /// `Last-Modified` in IMF-fixdate form.
    pub fn last_modified(&self) -> String {
        format_http_date(self.latest.to_offset_datetime())
    }

    fn apply(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.etag) {
            headers.insert(ETAG, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.last_modified()) {
            headers.insert(LAST_MODIFIED, value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    NotModified,
    Modified,
}

/// Compares request preconditions with the current validators.
///
/// `If-None-Match` wins when present; `If-Modified-Since` is only consulted
/// without it and compares at whole-second resolution.
pub fn evaluate(headers: &HeaderMap, validators: &Validators) -> Precondition {
    if let Some(if_none_match) = headers.get(IF_NONE_MATCH) {
        let matched = if_none_match
            .to_str()
            .is_ok_and(|value| etag_list_matches(value, validators.etag()));
        return if matched {
            Precondition::NotModified
        } else {
            Precondition::Modified
        };
    }

    let since = headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_http_date);
    match since {
        Some(since) if validators.latest.unix_seconds() <= since.unix_timestamp() => {
            Precondition::NotModified
        }
        _ => Precondition::Modified,
    }
}

fn etag_list_matches(list: &str, etag: &str) -> bool {
    let wanted = strip_weak(etag);
    list.split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || strip_weak(candidate) == wanted)
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

pub fn format_http_date(value: OffsetDateTime) -> String {
    value
        .to_offset(UtcOffset::UTC)
        .format(HTTP_DATE)
        .unwrap_or_default()
}

pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(value.trim(), HTTP_DATE)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

/// One page request: the primary entity plus anything else whose timestamp
/// feeds the validators (e.g. the viewer's display settings).
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub headers: &'a HeaderMap,
    pub entity: &'a EntityKey,
    pub related: &'a [EntityKey],
    pub viewer: &'a str,
    pub settings: &'a SettingsHash,
    pub content_type: &'static str,
}

/// Conditional GET on top of the render cache.
#[derive(Clone)]
pub struct ConditionalGet {
    cache: RenderCache,
}

impl ConditionalGet {
    pub fn new(cache: RenderCache) -> Self {
        Self { cache }
    }

    /// Answers `304` when the browser's copy is current, otherwise renders
    /// through the cache and answers `200` with fresh validators. Without a
    /// reachable backend the page is served without validators.
    pub async fn serve<F, Fut, E>(
        &self,
        request: PageRequest<'_>,
        render: F,
    ) -> Result<Response, RenderError<E>>
    where
        F: FnOnce(EntityKey) -> Fut,
        Fut: Future<Output = Result<Rendered, E>>,
    {
        let validators = match self.validators(&request).await {
            Ok(validators) => validators,
            Err(error) => {
                warn!(entity = %request.entity, error = %error, "Validators unavailable");
                None
            }
        };

        if let Some(validators) = validators.as_ref()
            && evaluate(request.headers, validators) == Precondition::NotModified
        {
            match self.cache.is_gone(request.entity).await {
                Ok(true) => return Err(RenderError::Gone(request.entity.clone())),
                Ok(false) => {}
                Err(error) => warn!(
                    entity = %request.entity,
                    error = %error,
                    "Tombstone check failed; trusting the browser copy"
                ),
            }
            debug!(entity = %request.entity, "Browser copy is current");
            return Ok(not_modified(validators));
        }

        let output = self
            .cache
            .get_or_render(request.entity, request.settings, render)
            .await?;

        let mut response = (StatusCode::OK, Body::from(output.body)).into_response();
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(request.content_type));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_VALUE));
        if let Some(validators) = validators.as_ref() {
            validators.apply(headers);
        }
        Ok(response)
    }

    async fn validators(
        &self,
        request: &PageRequest<'_>,
    ) -> Result<Option<Validators>, BackendError> {
        let timestamps = self.cache.timestamps();
        let collected = try_join_all(
            iter::once(request.entity)
                .chain(request.related)
                .map(|entity| timestamps.current(entity)),
        )
        .await?;
        Ok(Validators::new(collected, request.viewer))
    }
}

fn not_modified(validators: &Validators) -> Response {
    let mut response = StatusCode::NOT_MODIFIED.into_response();
    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_VALUE));
    validators.apply(headers);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validators() -> Validators {
        Validators::new(
            [
                Timestamp::from_micros(1_700_000_000_500_000),
                Timestamp::from_micros(1_600_000_000_000_000),
            ],
            "alice",
        )
        .unwrap()
    }

    fn headers(name: axum::http::HeaderName, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn last_modified_uses_the_latest_timestamp() {
        assert_eq!(validators().last_modified(), "Tue, 14 Nov 2023 22:13:20 GMT");
    }

    #[test]
    fn etag_depends_on_viewer() {
        let ts = [Timestamp::from_micros(1)];
        let alice = Validators::new(ts, "alice").unwrap();
        let bob = Validators::new(ts, "bob").unwrap();
        assert_ne!(alice.etag(), bob.etag());
        assert!(alice.etag().starts_with('"') && alice.etag().ends_with('"'));
        assert!(Validators::new(Vec::<Timestamp>::new(), "alice").is_none());
    }

    #[test]
    fn matching_etag_is_not_modified() {
        let validators = validators();
        let list = format!("\"other\", W/{}", validators.etag());
        assert_eq!(
            evaluate(&headers(IF_NONE_MATCH, &list), &validators),
            Precondition::NotModified
        );
        assert_eq!(
            evaluate(&headers(IF_NONE_MATCH, "*"), &validators),
            Precondition::NotModified
        );
        assert_eq!(
            evaluate(&headers(IF_NONE_MATCH, "\"stale\""), &validators),
            Precondition::Modified
        );
    }

    #[test]
    fn if_none_match_takes_precedence() {
        let validators = validators();
        let mut request = headers(IF_NONE_MATCH, "\"stale\"");
        request.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_static("Wed, 01 Jan 2031 00:00:00 GMT"),
        );
        assert_eq!(evaluate(&request, &validators), Precondition::Modified);
    }

    #[test]
    fn if_modified_since_compares_whole_seconds() {
        let validators = validators();
        let same_second = headers(IF_MODIFIED_SINCE, "Tue, 14 Nov 2023 22:13:20 GMT");
        let earlier = headers(IF_MODIFIED_SINCE, "Tue, 14 Nov 2023 22:13:19 GMT");
        let garbage = headers(IF_MODIFIED_SINCE, "yesterday");

        assert_eq!(evaluate(&same_second, &validators), Precondition::NotModified);
        assert_eq!(evaluate(&earlier, &validators), Precondition::Modified);
        assert_eq!(evaluate(&garbage, &validators), Precondition::Modified);
        assert_eq!(evaluate(&HeaderMap::new(), &validators), Precondition::Modified);
    }

    #[test]
    fn http_dates_round_trip() {
        let parsed = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(format_http_date(parsed), "Sun, 06 Nov 1994 08:49:37 GMT");
    }
}
