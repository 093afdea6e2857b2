//! Fetching remote pages into the raw store.

use chrono::{DateTime, SecondsFormat, Utc};
use lake_core::PipelineError;
use lake_storage::{ApiClient, ApiResponse, RawDataStore};
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What the collector knows about the request it is about to make.
#[derive(Debug, Clone, Copy)]
pub struct RequestData<'a> {
    pub page: u64,
    pub page_size: Option<u64>,
    pub since: Option<DateTime<Utc>>,
    pub input: Option<&'a JsonValue>,
}

pub trait Collectible: Send + Sync {
    /// Split a response into fragments, each stored as one raw record.
    fn parse_response(&self, response: &ApiResponse) -> Result<Vec<Box<RawValue>>, PipelineError>;

    fn query(&self, _request: &RequestData<'_>) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Checked after every non-empty page of a paged collection.
    fn is_last_page(&self, _request: &RequestData<'_>, _fragments: &[Box<RawValue>]) -> bool {
        false
    }
}

/// Fragments of a top-level JSON array.
pub fn parse_json_array(response: &ApiResponse) -> Result<Vec<Box<RawValue>>, PipelineError> {
    response
        .json::<Vec<Box<RawValue>>>()
        .map_err(|err| malformed_response(response, err))
}

/// A response body that cannot be split into fragments. Nothing was stored, so there is no
/// record id; the request URL stands in for the table.
pub fn malformed_response(response: &ApiResponse, reason: impl ToString) -> PipelineError {
    PipelineError::MalformedData {
        table: response.url.clone(),
        record_id: 0,
        reason: reason.to_string(),
    }
}

/// Fragments of the array found at `field` of a top-level JSON object.
///
/// A missing or null field yields no fragments.
pub fn parse_json_field_array(
    response: &ApiResponse,
    field: &str,
) -> Result<Vec<Box<RawValue>>, PipelineError> {
    let body: std::collections::HashMap<String, Box<RawValue>> =
        response.json().map_err(|err| malformed_response(response, err))?;
    match body.get(field) {
        None => Ok(Vec::new()),
        Some(raw) if raw.get() == "null" => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(raw.get()).map_err(|err| {
            malformed_response(response, format!("field {field:?} is not an array: {err}"))
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Page,
    PageSize,
    Since,
    Input(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UrlTemplate {
    segments: Vec<Segment>,
}

impl UrlTemplate {
    fn parse(template: &str) -> Result<Self, PipelineError> {
        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                PipelineError::config(format!("unclosed placeholder in url template {template:?}"))
            })?;
            let name = &after[..close];
            segments.push(match name {
                "page" => Segment::Page,
                "page_size" => Segment::PageSize,
                "since" => Segment::Since,
                other => match other.strip_prefix("input.") {
                    Some(field) if !field.is_empty() => Segment::Input(field.to_string()),
                    _ => {
                        return Err(PipelineError::config(format!(
                            "unknown placeholder {{{other}}} in url template {template:?}"
                        )))
                    }
                },
            });
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self { segments })
    }

    fn uses_input(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Input(_)))
    }

    fn render(&self, request: &RequestData<'_>) -> Result<String, PipelineError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Page => out.push_str(&request.page.to_string()),
                Segment::PageSize => {
                    out.push_str(&request.page_size.map(|s| s.to_string()).unwrap_or_default())
                }
                Segment::Since => {
                    if let Some(since) = request.since {
                        out.push_str(&since.to_rfc3339_opts(SecondsFormat::Secs, true));
                    }
                }
                Segment::Input(field) => {
                    let value = request
                        .input
                        .and_then(|input| input.get(field))
                        .ok_or_else(|| {
                            PipelineError::config(format!("collector input has no field {field:?}"))
                        })?;
                    match value {
                        JsonValue::String(text) => out.push_str(text),
                        other => out.push_str(&other.to_string()),
                    }
                }
            }
        }
        Ok(out)
    }
}

pub struct ApiCollectorArgs<C> {
    /// `raw_<plugin>_<table>`
    pub raw_table: String,
    /// Partition signature, see [`lake_storage::params_signature`].
    pub params: String,
    pub client: ApiClient,
    pub url_template: String,
    pub page_size: Option<u64>,
    pub incremental: bool,
    /// One pagination pass runs per item.
    pub input: Option<Vec<JsonValue>>,
    pub collectible: C,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectSummary {
    pub requests: usize,
    pub fragments: usize,
    pub since: Option<DateTime<Utc>>,
}

pub struct ApiCollector<C> {
    args: ApiCollectorArgs<C>,
    template: UrlTemplate,
}

impl<C: Collectible> ApiCollector<C> {
    pub fn new(args: ApiCollectorArgs<C>) -> Result<Self, PipelineError> {
        let template = UrlTemplate::parse(&args.url_template)?;
        if template.uses_input() && args.input.is_none() {
            return Err(PipelineError::config(format!(
                "url template {:?} references input but the collector has none",
                args.url_template
            )));
        }
        Ok(Self { args, template })
    }

    pub async fn execute(
        &self,
        raw: &RawDataStore,
        cancel: &CancellationToken,
    ) -> Result<CollectSummary, PipelineError> {
        let args = &self.args;
        let started_at = Utc::now();
        let since = if args.incremental {
            raw.collector_state(&args.raw_table, &args.params).await?
        } else {
            None
        };
        if since.is_none() {
            let pruned = raw.delete_partition(&args.raw_table, &args.params).await?;
            debug!(table = %args.raw_table, pruned, "full collection, partition pruned");
        }

        let inputs: Vec<Option<&JsonValue>> = match &args.input {
            Some(items) => items.iter().map(Some).collect(),
            None => vec![None],
        };

        let mut summary = CollectSummary {
            since,
            ..CollectSummary::default()
        };
        for input in inputs {
            self.collect_input(raw, cancel, since, input, &mut summary)
                .await?;
        }

        raw.save_collector_state(&args.raw_table, &args.params, started_at)
            .await?;
        info!(
            table = %args.raw_table,
            requests = summary.requests,
            fragments = summary.fragments,
            incremental = since.is_some(),
            "collection finished"
        );
        Ok(summary)
    }

    async fn collect_input(
        &self,
        raw: &RawDataStore,
        cancel: &CancellationToken,
        since: Option<DateTime<Utc>>,
        input: Option<&JsonValue>,
        summary: &mut CollectSummary,
    ) -> Result<(), PipelineError> {
        let args = &self.args;
        let input_json = input.map(JsonValue::to_string);
        let mut page = 1u64;

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let request = RequestData {
                page,
                page_size: args.page_size,
                since,
                input,
            };
            let path = self.template.render(&request)?;
            let query = args.collectible.query(&request);

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                response = args.client.get(&path, &query) => response,
            };
            summary.requests += 1;
            let response = match response {
                Ok(response) => response,
                Err(err) if err.status() == Some(404) => {
                    debug!(path = %path, "404, pagination ends");
                    break;
                }
                Err(err) => return Err(err.into()),
            };

            let fragments = args.collectible.parse_response(&response)?;
            let count = fragments.len();
            for fragment in &fragments {
                raw.append(
                    &args.raw_table,
                    &args.params,
                    fragment.get().as_bytes(),
                    Some(&response.url),
                    input_json.as_deref(),
                )
                .await?;
            }
            summary.fragments += count;

            if args.page_size.is_none()
                || count == 0
                || args.collectible.is_last_page(&request, &fragments)
            {
                break;
            }
            page += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lake_storage::{ApiClientConfig, BackoffPolicy, Store};
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Pages;

    impl Collectible for Pages {
        fn parse_response(&self, response: &ApiResponse) -> Result<Vec<Box<RawValue>>, PipelineError> {
            parse_json_array(response)
        }

        fn query(&self, request: &RequestData<'_>) -> Vec<(String, String)> {
            let mut query = vec![("page".to_string(), request.page.to_string())];
            if let Some(since) = request.since {
                query.push(("since".to_string(), since.to_rfc3339_opts(SecondsFormat::Secs, true)));
            }
            query
        }
    }

    fn client(server: &MockServer) -> ApiClient {
        ApiClient::new(ApiClientConfig {
            endpoint: server.uri(),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..ApiClientConfig::default()
        })
        .expect("client")
    }

    fn args(server: &MockServer, template: &str, incremental: bool) -> ApiCollectorArgs<Pages> {
        ApiCollectorArgs {
            raw_table: "raw_test_items".into(),
            params: "{\"repo\":1}".into(),
            client: client(server),
            url_template: template.into(),
            page_size: Some(2),
            incremental,
            input: None,
            collectible: Pages,
        }
    }

    async fn raw_store() -> RawDataStore {
        RawDataStore::new(Store::in_memory().await.expect("store"))
    }

    #[test]
    fn templates_reject_unknown_placeholders() {
        assert!(UrlTemplate::parse("repos/{owner}/pulls").is_err());
        assert!(UrlTemplate::parse("repos/{page").is_err());
        assert!(UrlTemplate::parse("issues/{input.}").is_err());

        let template = UrlTemplate::parse("issues/{input.key}/changelog?p={page}").unwrap();
        let input = serde_json::json!({"key": "PRJ-1"});
        let rendered = template
            .render(&RequestData {
                page: 3,
                page_size: None,
                since: None,
                input: Some(&input),
            })
            .unwrap();
        assert_eq!(rendered, "issues/PRJ-1/changelog?p=3");
    }

    #[tokio::test]
    async fn input_placeholder_without_input_fails_before_any_request() {
        let server = MockServer::start().await;
        let result = ApiCollector::new(args(&server, "issues/{input.id}", false));
        assert_eq!(result.err().map(|e| e.kind()), Some("configuration"));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn pagination_stops_on_empty_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"id":1}, {"id":2}]"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"id":3}]"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("page", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let raw = raw_store().await;
        let collector = ApiCollector::new(args(&server, "items", false)).unwrap();
        let summary = collector
            .execute(&raw, &CancellationToken::new())
            .await
            .expect("collect");
        assert_eq!(summary.requests, 3);
        assert_eq!(summary.fragments, 3);

        let mut cursor = raw.scan("raw_test_items", "{\"repo\":1}");
        let first = cursor.next_record().await.unwrap().unwrap();
        assert_eq!(first.data, br#"{"id":1}"#.to_vec());
    }

    #[tokio::test]
    async fn not_found_ends_pagination_without_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"id":1},{"id":2}]"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let raw = raw_store().await;
        let collector = ApiCollector::new(args(&server, "items", false)).unwrap();
        let summary = collector
            .execute(&raw, &CancellationToken::new())
            .await
            .expect("collect");
        assert_eq!(summary.fragments, 2);
    }

    #[tokio::test]
    async fn unparseable_body_is_malformed_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let raw = raw_store().await;
        let collector = ApiCollector::new(args(&server, "items", false)).unwrap();
        let err = collector
            .execute(&raw, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "malformed_data");
        assert_eq!(raw.count("raw_test_items", "{\"repo\":1}").await.unwrap(), 0);
    }

    #[test]
    fn non_array_field_is_malformed_data() {
        let response = ApiResponse {
            status: 200,
            url: "http://lake.test/issues".into(),
            body: br#"{"issues":{"id":1}}"#.to_vec(),
        };
        match parse_json_field_array(&response, "issues").unwrap_err() {
            PipelineError::MalformedData { table, record_id, .. } => {
                assert_eq!(table, "http://lake.test/issues");
                assert_eq!(record_id, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_client_errors_surface_as_remote() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let raw = raw_store().await;
        let collector = ApiCollector::new(args(&server, "items", false)).unwrap();
        let err = collector
            .execute(&raw, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "remote");
        assert!(raw.collector_state("raw_test_items", "{\"repo\":1}").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn incremental_run_passes_since_and_keeps_partition() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("since", "2020-02-01T00:00:00Z"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"id":9}]"#))
            .mount(&server)
            .await;

        let raw = raw_store().await;
        raw.append("raw_test_items", "{\"repo\":1}", b"{\"id\":1}", None, None)
            .await
            .unwrap();
        let since = Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).single().unwrap();
        raw.save_collector_state("raw_test_items", "{\"repo\":1}", since)
            .await
            .unwrap();

        let collector = ApiCollector::new(args(&server, "items", true)).unwrap();
        let summary = collector
            .execute(&raw, &CancellationToken::new())
            .await
            .expect("collect");
        assert_eq!(summary.since, Some(since));
        assert_eq!(summary.fragments, 1);
        assert_eq!(raw.count("raw_test_items", "{\"repo\":1}").await.unwrap(), 2);

        let advanced = raw
            .collector_state("raw_test_items", "{\"repo\":1}")
            .await
            .unwrap()
            .unwrap();
        assert!(advanced > since);
    }

    #[tokio::test]
    async fn full_run_prunes_the_partition_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"id":1}]"#))
            .mount(&server)
            .await;

        let raw = raw_store().await;
        let collector = ApiCollector::new(args(&server, "items", false)).unwrap();
        for _ in 0..2 {
            collector
                .execute(&raw, &CancellationToken::new())
                .await
                .expect("collect");
        }
        assert_eq!(raw.count("raw_test_items", "{\"repo\":1}").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn input_driven_collection_records_the_input() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/issues/11/changelog"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"id":"a"}]"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/issues/12/changelog"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"id":"b"}]"#))
            .mount(&server)
            .await;

        let raw = raw_store().await;
        let mut collector_args = args(&server, "issues/{input.issue_id}/changelog", false);
        collector_args.page_size = None;
        collector_args.input = Some(vec![
            serde_json::json!({"issue_id": 11}),
            serde_json::json!({"issue_id": 12}),
        ]);
        let collector = ApiCollector::new(collector_args).unwrap();
        let summary = collector
            .execute(&raw, &CancellationToken::new())
            .await
            .expect("collect");
        assert_eq!(summary.requests, 2);

        let mut cursor = raw.scan("raw_test_items", "{\"repo\":1}");
        let first = cursor.next_record().await.unwrap().unwrap();
        assert_eq!(
            first.input_value().unwrap(),
            Some(serde_json::json!({"issue_id": 11}))
        );
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_requests() {
        let server = MockServer::start().await;
        let raw = raw_store().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let collector = ApiCollector::new(args(&server, "items", false)).unwrap();
        let err = collector.execute(&raw, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }
}
