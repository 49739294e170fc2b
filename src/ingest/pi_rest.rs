//! Delft-FEWS PI-REST client
//!
//! Requests time series and catalogs (locations, parameters, filters,
//! qualifiers, time zone) from a FEWS PI-REST web service and decodes the
//! responses. Failed requests never raise: they are logged and yield an
//! empty result.
//!
//! Service documentation: https://publicwiki.deltares.nl/display/FEWSDOC/FEWS+PI+REST+Web+Service

use std::time::Duration;

use chrono::NaiveDateTime;

use serde_json::Value;

use crate::conversions::datetime_to_fews_str;
use crate::error::{Error, Result};
use crate::ingest::catalog::{self, Locations, Parameter, Qualifier};
use crate::io::{DocumentFormat, Payload, decode};
use crate::logging::{Component, Observer, log_fetch_failure, log_fetch_summary};
use crate::model::TimeSeriesSet;

/// Query parameters of one request, in order. Keys may repeat.
pub type Query = Vec<(&'static str, String)>;

/// PI-REST resources below the service root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    TimeSeries,
    Locations,
    Parameters,
    Filters,
    Qualifiers,
    TimeZoneId,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::TimeSeries => "timeseries",
            Endpoint::Locations => "locations",
            Endpoint::Parameters => "parameters",
            Endpoint::Filters => "filters",
            Endpoint::Qualifiers => "qualifiers",
            Endpoint::TimeZoneId => "timezoneid",
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// Parameters of one `timeseries` request.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesRequest {
    pub filter_id: String,
    pub location_ids: Vec<String>,
    pub parameter_ids: Vec<String>,
    pub qualifier_ids: Vec<String>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub thinning: Option<u64>,
    pub only_headers: bool,
    pub show_statistics: bool,
    pub omit_missing: bool,
    pub document_format: DocumentFormat,
}

impl TimeSeriesRequest {
    pub fn new(filter_id: impl Into<String>) -> Self {
        Self {
            filter_id: filter_id.into(),
            location_ids: Vec::new(),
            parameter_ids: Vec::new(),
            qualifier_ids: Vec::new(),
            start_time: None,
            end_time: None,
            thinning: None,
            only_headers: false,
            show_statistics: false,
            omit_missing: true,
            document_format: DocumentFormat::PiJson,
        }
    }

    /// Query parameters in request order. List parameters repeat their key.
    pub fn query_pairs(&self) -> Result<Query> {
        let document_format = self.document_format.as_query_value().ok_or_else(|| {
            Error::format(format!(
                "{:?} is not served by the PI-REST service",
                self.document_format
            ))
        })?;

        let mut pairs = vec![("filterId", self.filter_id.clone())];
        pairs.extend(self.location_ids.iter().map(|id| ("locationIds", id.clone())));
        pairs.extend(self.parameter_ids.iter().map(|id| ("parameterIds", id.clone())));
        pairs.extend(self.qualifier_ids.iter().map(|id| ("qualifierIds", id.clone())));
        if let Some(start) = &self.start_time {
            pairs.push(("startTime", datetime_to_fews_str(start)));
        }
        if let Some(end) = &self.end_time {
            pairs.push(("endTime", datetime_to_fews_str(end)));
        }
        if let Some(thinning) = self.thinning {
            pairs.push(("thinning", thinning.to_string()));
        }
        pairs.push(("onlyHeaders", self.only_headers.to_string()));
        pairs.push(("showStatistics", self.show_statistics.to_string()));
        pairs.push(("omitMissing", self.omit_missing.to_string()));
        pairs.push(("documentFormat", document_format.to_string()));
        Ok(pairs)
    }

    fn subject(&self) -> String {
        if self.location_ids.is_empty() {
            self.filter_id.clone()
        } else {
            format!("{}:{}", self.filter_id, self.location_ids.join(","))
        }
    }
}

/// Parameters of a `locations`, `parameters`, `filters` or `timezoneid`
/// request. Catalogs are always requested as PI JSON.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogRequest {
    pub filter_id: Option<String>,
    /// Ask for location attributes (`locations` only).
    pub show_attributes: bool,
}

impl CatalogRequest {
    pub fn for_filter(filter_id: Option<&str>) -> Self {
        Self {
            filter_id: filter_id.map(String::from),
            show_attributes: false,
        }
    }

    pub fn query_pairs(&self) -> Query {
        let mut pairs = Vec::new();
        if let Some(filter_id) = &self.filter_id {
            pairs.push(("filterId", filter_id.clone()));
        }
        if self.show_attributes {
            pairs.push(("showAttributes", "true".to_string()));
        }
        pairs.push(("documentFormat", "PI_JSON".to_string()));
        pairs
    }

    fn subject(&self, endpoint: Endpoint) -> String {
        match &self.filter_id {
            Some(filter_id) => format!("{}:{}", endpoint.path(), filter_id),
            None => endpoint.path().to_string(),
        }
    }
}

// ============================================================================
// Fetcher
// ============================================================================

/// Source of raw PI-REST response bodies.
pub trait RemoteFetcher: Send + Sync {
    fn fetch(&self, endpoint: Endpoint, query: &[(&'static str, String)]) -> Result<Vec<u8>>;
}

/// Blocking HTTP fetcher for a PI-REST service root such as
/// `http://localhost:8080/FewsWebServices/rest/fewspiservice/v1/`.
#[derive(Debug, Clone)]
pub struct PiRestClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl PiRestClient {
    pub fn new(url: &str, timeout: Duration, ssl_verify: bool) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!ssl_verify)
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: normalize_base_url(url),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint_url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }
}

/// Service root with exactly one trailing slash.
fn normalize_base_url(url: &str) -> String {
    format!("{}/", url.trim_end_matches('/'))
}

impl RemoteFetcher for PiRestClient {
    fn fetch(&self, endpoint: Endpoint, query: &[(&'static str, String)]) -> Result<Vec<u8>> {
        let url = self.endpoint_url(endpoint);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .map_err(|e| Error::http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::http_status(
                status.as_u16(),
                format!("{}: {}", url, body),
            ));
        }

        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| Error::http(e.to_string()))
    }
}

// ============================================================================
// Time series retrieval
// ============================================================================

fn try_get_time_series(
    fetcher: &dyn RemoteFetcher,
    request: &TimeSeriesRequest,
) -> Result<TimeSeriesSet> {
    let content = fetcher.fetch(Endpoint::TimeSeries, &request.query_pairs()?)?;
    decode(Payload::Bytes(&content), request.document_format)
}

/// Fetch and decode one request.
///
/// A failed request or an undecodable response yields an empty set; the
/// failure is reported to `observer`.
pub fn get_time_series(
    fetcher: &dyn RemoteFetcher,
    request: &TimeSeriesRequest,
    observer: &dyn Observer,
) -> TimeSeriesSet {
    match try_get_time_series(fetcher, request) {
        Ok(set) => {
            if set.is_empty() {
                observer.debug(
                    Component::Remote,
                    Some(&request.subject()),
                    "request returned an empty time series set",
                );
            }
            set
        }
        Err(err) => {
            log_fetch_failure(observer, &request.subject(), "get_time_series", &err);
            TimeSeriesSet::new()
        }
    }
}

/// Fetch every request in order and merge the results.
///
/// Failed requests are skipped; a success/failure summary is logged.
pub fn get_time_series_bulk(
    fetcher: &dyn RemoteFetcher,
    requests: &[TimeSeriesRequest],
    observer: &dyn Observer,
) -> TimeSeriesSet {
    let mut merged = TimeSeriesSet::new();
    let mut successful = 0;

    for request in requests {
        match try_get_time_series(fetcher, request) {
            Ok(set) => {
                successful += 1;
                merged.add(set);
            }
            Err(err) => {
                log_fetch_failure(observer, &request.subject(), "get_time_series_bulk", &err);
            }
        }
    }

    log_fetch_summary(observer, requests.len(), successful, requests.len() - successful);
    merged
}

// ============================================================================
// Catalogs
// ============================================================================

fn fetch_catalog<T>(
    fetcher: &dyn RemoteFetcher,
    endpoint: Endpoint,
    query: &[(&'static str, String)],
    subject: &str,
    observer: &dyn Observer,
    decode_body: impl FnOnce(&[u8]) -> Result<T>,
) -> Option<T> {
    let result = fetcher
        .fetch(endpoint, query)
        .and_then(|content| decode_body(&content));
    match result {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            let operation = format!("{} request", endpoint.path());
            log_fetch_failure(observer, subject, &operation, &err);
            None
        }
    }
}

/// Locations of a filter (all locations without one). `attributes` names
/// the location attributes to add as fields.
pub fn get_locations(
    fetcher: &dyn RemoteFetcher,
    filter_id: Option<&str>,
    attributes: &[String],
    observer: &dyn Observer,
) -> Locations {
    let mut request = CatalogRequest::for_filter(filter_id);
    request.show_attributes = !attributes.is_empty();
    fetch_catalog(
        fetcher,
        Endpoint::Locations,
        &request.query_pairs(),
        &request.subject(Endpoint::Locations),
        observer,
        |body| catalog::decode_locations(body, attributes),
    )
    .unwrap_or_default()
}

pub fn get_parameters(
    fetcher: &dyn RemoteFetcher,
    filter_id: Option<&str>,
    observer: &dyn Observer,
) -> Vec<Parameter> {
    let request = CatalogRequest::for_filter(filter_id);
    fetch_catalog(
        fetcher,
        Endpoint::Parameters,
        &request.query_pairs(),
        &request.subject(Endpoint::Parameters),
        observer,
        catalog::decode_parameters,
    )
    .unwrap_or_default()
}

pub fn get_filters(
    fetcher: &dyn RemoteFetcher,
    filter_id: Option<&str>,
    observer: &dyn Observer,
) -> Vec<Value> {
    let request = CatalogRequest::for_filter(filter_id);
    fetch_catalog(
        fetcher,
        Endpoint::Filters,
        &request.query_pairs(),
        &request.subject(Endpoint::Filters),
        observer,
        catalog::decode_filters,
    )
    .unwrap_or_default()
}

/// Qualifiers are served as PI XML and take no parameters.
pub fn get_qualifiers(fetcher: &dyn RemoteFetcher, observer: &dyn Observer) -> Vec<Qualifier> {
    fetch_catalog(
        fetcher,
        Endpoint::Qualifiers,
        &[],
        Endpoint::Qualifiers.path(),
        observer,
        catalog::decode_qualifiers,
    )
    .unwrap_or_default()
}

/// Time zone the service reports dates in. `None` when the request fails.
pub fn get_timezone_id(
    fetcher: &dyn RemoteFetcher,
    filter_id: Option<&str>,
    observer: &dyn Observer,
) -> Option<String> {
    let request = CatalogRequest::for_filter(filter_id);
    fetch_catalog(
        fetcher,
        Endpoint::TimeZoneId,
        &request.query_pairs(),
        &request.subject(Endpoint::TimeZoneId),
        observer,
        catalog::decode_timezone_id,
    )
}

// ============================================================================
// Tests
// ============================================================================
