//! Collaborator clients: the relational record source and the external
//! search API, each behind a trait so the pipeline can be tested against
//! in-memory fakes.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use acre_core::{RecordId, ID_FIELD};
use acre_transport::{build_http_client, ErrorClass};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "acre-remote";

const API_VERSION: &str = "v59.0";

// ---------------------------------------------------------------------------
// Credentials

const USERNAME_ENV: &[&str] = &["CRM_USERNAME", "SF_USERNAME", "SFDC_USERNAME"];
const PASSWORD_ENV: &[&str] = &["CRM_PASSWORD", "SF_PASSWORD", "SFDC_PASSWORD"];
const SECURITY_TOKEN_ENV: &[&str] = &[
    "CRM_SECURITY_TOKEN",
    "SF_SECURITY_TOKEN",
    "SFDC_SECURITY_TOKEN",
];
const CLIENT_ID_ENV: &[&str] = &["CRM_CLIENT_ID", "SFDC_CLIENT_ID", "SF_CLIENT_ID", "CONSUMER_KEY"];
const CLIENT_SECRET_ENV: &[&str] = &[
    "CRM_CLIENT_SECRET",
    "SFDC_CLIENT_SECRET",
    "SF_CLIENT_SECRET",
    "CONSUMER_SECRET",
];
const LOGIN_URL_ENV: &[&str] = &["CRM_LOGIN_URL", "SF_LOGIN_URL"];
const SEARCH_KEY_ENV: &[&str] = &["SERPAPI_API_KEY", "SEARCH_API_KEY"];

const DEFAULT_LOGIN_URL: &str = "https://login.salesforce.com";

fn env_first(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no usable credentials: supply a username/password pair or a client id/secret pair (CRM_USERNAME, CRM_PASSWORD / CRM_CLIENT_ID, CRM_CLIENT_SECRET)")]
    Missing,
}

/// Explicit constructor arguments; any `None` falls through to the
/// environment-name chain for that slot.
#[derive(Debug, Clone, Default)]
pub struct CredentialOverrides {
    pub username: Option<String>,
    pub password: Option<String>,
    pub security_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub login_url: Option<String>,
}

/// Resolved once at construction; nothing reads the environment after
/// this.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub login_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub security_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthGrant {
    Password,
    ClientCredentials,
}

impl Credentials {
    /// Prioritized resolution: explicit argument, then the first matching
    /// named environment variable, then the default.
    pub fn resolve(overrides: CredentialOverrides) -> Result<Self, CredentialError> {
        let credentials = Self {
            login_url: overrides
                .login_url
                .or_else(|| env_first(LOGIN_URL_ENV))
                .unwrap_or_else(|| DEFAULT_LOGIN_URL.to_string()),
            username: overrides.username.or_else(|| env_first(USERNAME_ENV)),
            password: overrides.password.or_else(|| env_first(PASSWORD_ENV)),
            security_token: overrides
                .security_token
                .or_else(|| env_first(SECURITY_TOKEN_ENV)),
            client_id: overrides.client_id.or_else(|| env_first(CLIENT_ID_ENV)),
            client_secret: overrides
                .client_secret
                .or_else(|| env_first(CLIENT_SECRET_ENV)),
        };
        credentials.grant()?;
        Ok(credentials)
    }

    /// Username/password wins when both flows are configured.
    pub fn grant(&self) -> Result<AuthGrant, CredentialError> {
        if self.username.is_some() && self.password.is_some() {
            return Ok(AuthGrant::Password);
        }
        if self.client_id.is_some() && self.client_secret.is_some() {
            return Ok(AuthGrant::ClientCredentials);
        }
        Err(CredentialError::Missing)
    }
}

/// Explicit key, then the environment chain. The search client refuses to
/// construct without one.
pub fn resolve_search_api_key(explicit: Option<String>) -> Option<String> {
    explicit
        .filter(|k| !k.is_empty())
        .or_else(|| env_first(SEARCH_KEY_ENV))
}

// ---------------------------------------------------------------------------
// Record source

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("invalid field in projection: {0}")]
    InvalidField(String),
    #[error("transient source failure: {0}")]
    Transient(String),
    #[error("source request failed: {0}")]
    Permanent(String),
    #[error("malformed source response: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        match ErrorClass::of_reqwest_error(&err) {
            ErrorClass::Transient => SourceError::Transient(err.to_string()),
            ErrorClass::Permanent => SourceError::Permanent(err.to_string()),
        }
    }
}

/// One remote row: identifier plus the requested cells.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRow {
    pub id: RecordId,
    pub cells: BTreeMap<String, Value>,
}

/// The relational remote source, consumed at its interface boundary. The
/// projection never includes the identifier; implementations always select
/// it.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Read-only projection query, optionally restricted to an id set
    /// and/or a row limit.
    async fn query_records(
        &self,
        fields: &[String],
        id_filter: Option<&[RecordId]>,
        limit: Option<usize>,
    ) -> Result<Vec<RecordRow>, SourceError>;

    /// Field-metadata capability used for invalid-field recovery.
    async fn describe_field_names(&self) -> Result<HashSet<String>, SourceError>;

    async fn update_record(
        &self,
        id: &RecordId,
        patch: &BTreeMap<String, Value>,
    ) -> Result<(), SourceError>;

    /// Moves all child records of `from` under `to`; returns how many were
    /// moved.
    async fn reparent_children(&self, from: &RecordId, to: &RecordId)
        -> Result<u64, SourceError>;

    async fn delete_record(&self, id: &RecordId) -> Result<(), SourceError>;
}

/// One child relation the dedup apply step must preserve before deleting a
/// duplicate parent.
#[derive(Debug, Clone)]
pub struct ChildRelation {
    pub object: String,
    pub parent_field: String,
}

impl ChildRelation {
    pub fn new(object: &str, parent_field: &str) -> Self {
        Self {
            object: object.to_string(),
            parent_field: parent_field.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub object: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub child_relations: Vec<ChildRelation>,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            object: "Account".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            child_relations: vec![
                ChildRelation::new("Opportunity", "AccountId"),
                ChildRelation::new("Case", "AccountId"),
                ChildRelation::new("Task", "WhatId"),
                ChildRelation::new("Note", "ParentId"),
                ChildRelation::new("Attachment", "ParentId"),
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    done: bool,
    #[serde(rename = "nextRecordsUrl")]
    next_records_url: Option<String>,
    #[serde(default)]
    records: Vec<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(rename = "errorCode", default)]
    error_code: String,
}

/// REST implementation of [`RecordSource`]: token auth at construction,
/// SOQL-style projection queries with follow-the-cursor pagination,
/// describe, and record mutation endpoints. Retrying is left to callers so
/// the retry policy stays in one place.
pub struct RestRecordSource {
    client: reqwest::Client,
    instance_url: String,
    access_token: String,
    object: String,
    child_relations: Vec<ChildRelation>,
}

impl RestRecordSource {
    pub async fn connect(
        credentials: Credentials,
        options: RemoteOptions,
    ) -> Result<Self, SourceError> {
        let client = build_http_client(options.timeout, options.user_agent.as_deref())
            .map_err(|e| SourceError::Permanent(e.to_string()))?;

        let grant = credentials
            .grant()
            .map_err(|e| SourceError::Auth(e.to_string()))?;
        let mut form: Vec<(&str, String)> = Vec::new();
        match grant {
            AuthGrant::Password => {
                // Security token is appended to the password, per the
                // source's username/password flow.
                let password = format!(
                    "{}{}",
                    credentials.password.clone().unwrap_or_default(),
                    credentials.security_token.clone().unwrap_or_default()
                );
                form.push(("grant_type", "password".to_string()));
                form.push(("username", credentials.username.clone().unwrap_or_default()));
                form.push(("password", password));
                if let Some(client_id) = &credentials.client_id {
                    form.push(("client_id", client_id.clone()));
                }
                if let Some(client_secret) = &credentials.client_secret {
                    form.push(("client_secret", client_secret.clone()));
                }
            }
            AuthGrant::ClientCredentials => {
                form.push(("grant_type", "client_credentials".to_string()));
                form.push(("client_id", credentials.client_id.clone().unwrap_or_default()));
                form.push((
                    "client_secret",
                    credentials.client_secret.clone().unwrap_or_default(),
                ));
            }
        }

        let token_url = format!("{}/services/oauth2/token", credentials.login_url);
        let response = client
            .post(&token_url)
            .form(&form)
            .send()
            .await
            .map_err(SourceError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        debug!(instance_url = %token.instance_url, "authenticated against record source");

        Ok(Self {
            client,
            instance_url: token.instance_url,
            access_token: token.access_token,
            object: options.object,
            child_relations: options.child_relations,
        })
    }

    fn query_url(&self, soql: &str) -> String {
        format!(
            "{}/services/data/{}/query?q={}",
            self.instance_url,
            API_VERSION,
            urlencode(soql)
        )
    }

    fn sobject_url(&self, object: &str, id: Option<&RecordId>) -> String {
        match id {
            Some(id) => format!(
                "{}/services/data/{}/sobjects/{}/{}",
                self.instance_url, API_VERSION, object, id
            ),
            None => format!(
                "{}/services/data/{}/sobjects/{}",
                self.instance_url, API_VERSION, object
            ),
        }
    }

    async fn run_query(&self, soql: &str) -> Result<Vec<RecordRow>, SourceError> {
        let mut rows = Vec::new();
        let mut url = self.query_url(soql);
        loop {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.access_token)
                .send()
                .await
                .map_err(SourceError::from_reqwest)?;
            let page: QueryResponse = Self::decode_response(response).await?;
            for record in page.records {
                if let Some(row) = record_row_from_json(record) {
                    rows.push(row);
                }
            }
            match (page.done, page.next_records_url) {
                (false, Some(next)) => url = format!("{}{}", self.instance_url, next),
                _ => break,
            }
        }
        Ok(rows)
    }

    async fn decode_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, SourceError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| SourceError::Decode(e.to_string()));
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Err(classify_api_error(status, &body))
    }

    async fn check_response(response: reqwest::Response) -> Result<(), SourceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Err(classify_api_error(status, &body))
    }
}

/// Maps a non-success status plus the API's error array onto the source
/// error taxonomy.
fn classify_api_error(status: reqwest::StatusCode, body: &Value) -> SourceError {
    let errors: Vec<ApiErrorBody> = body
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    let message = errors
        .iter()
        .map(|e| e.message.as_str())
        .filter(|m| !m.is_empty())
        .collect::<Vec<_>>()
        .join("; ");
    let message = if message.is_empty() {
        format!("status {status}")
    } else {
        message
    };

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return SourceError::Auth(message);
    }
    if errors.iter().any(|e| e.error_code.contains("INVALID_FIELD")) {
        return SourceError::InvalidField(message);
    }
    match ErrorClass::of_status(status) {
        ErrorClass::Transient => SourceError::Transient(message),
        ErrorClass::Permanent => SourceError::Permanent(message),
    }
}

fn record_row_from_json(mut record: serde_json::Map<String, Value>) -> Option<RecordRow> {
    record.remove("attributes");
    let id = match record.get(ID_FIELD) {
        Some(Value::String(id)) if !id.is_empty() => RecordId::new(id.clone()),
        _ => return None,
    };
    Some(RecordRow {
        id,
        cells: record.into_iter().collect(),
    })
}

/// Builds the projection query. The identifier is always selected first;
/// id filters become a quoted membership clause.
pub fn build_soql(
    object: &str,
    fields: &[String],
    id_filter: Option<&[RecordId]>,
    limit: Option<usize>,
) -> String {
    let mut select = Vec::with_capacity(fields.len() + 1);
    select.push(ID_FIELD.to_string());
    select.extend(fields.iter().filter(|f| f.as_str() != ID_FIELD).cloned());
    let mut soql = format!("SELECT {} FROM {}", select.join(", "), object);
    if let Some(ids) = id_filter {
        if !ids.is_empty() {
            let quoted = ids
                .iter()
                .map(|id| format!("'{}'", id.as_str().replace('\'', "\\'")))
                .collect::<Vec<_>>()
                .join(", ");
            soql.push_str(&format!(" WHERE {ID_FIELD} IN ({quoted})"));
        }
    }
    if let Some(limit) = limit {
        soql.push_str(&format!(" LIMIT {limit}"));
    }
    soql
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[async_trait]
impl RecordSource for RestRecordSource {
    async fn query_records(
        &self,
        fields: &[String],
        id_filter: Option<&[RecordId]>,
        limit: Option<usize>,
    ) -> Result<Vec<RecordRow>, SourceError> {
        let soql = build_soql(&self.object, fields, id_filter, limit);
        self.run_query(&soql).await
    }

    async fn describe_field_names(&self) -> Result<HashSet<String>, SourceError> {
        let url = format!("{}/describe", self.sobject_url(&self.object, None));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(SourceError::from_reqwest)?;
        let body: Value = Self::decode_response(response).await?;
        let names = body
            .get("fields")
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|f| f.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    async fn update_record(
        &self,
        id: &RecordId,
        patch: &BTreeMap<String, Value>,
    ) -> Result<(), SourceError> {
        let url = self.sobject_url(&self.object, Some(id));
        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.access_token)
            .json(patch)
            .send()
            .await
            .map_err(SourceError::from_reqwest)?;
        Self::check_response(response).await
    }

    async fn reparent_children(
        &self,
        from: &RecordId,
        to: &RecordId,
    ) -> Result<u64, SourceError> {
        let mut moved = 0u64;
        for relation in &self.child_relations {
            let soql = format!(
                "SELECT {} FROM {} WHERE {} = '{}'",
                ID_FIELD,
                relation.object,
                relation.parent_field,
                from.as_str().replace('\'', "\\'")
            );
            let children = self.run_query(&soql).await?;
            for child in children {
                let url = self.sobject_url(&relation.object, Some(&child.id));
                let mut patch = serde_json::Map::new();
                patch.insert(
                    relation.parent_field.clone(),
                    Value::String(to.as_str().to_string()),
                );
                let response = self
                    .client
                    .patch(&url)
                    .bearer_auth(&self.access_token)
                    .json(&patch)
                    .send()
                    .await
                    .map_err(SourceError::from_reqwest)?;
                Self::check_response(response).await?;
                moved += 1;
            }
            if moved > 0 {
                debug!(
                    object = relation.object.as_str(),
                    from = %from,
                    to = %to,
                    "reparented child records"
                );
            }
        }
        Ok(moved)
    }

    async fn delete_record(&self, id: &RecordId) -> Result<(), SourceError> {
        let url = self.sobject_url(&self.object, Some(id));
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(SourceError::from_reqwest)?;
        Self::check_response(response).await
    }
}

// ---------------------------------------------------------------------------
// Search API

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("transient search failure: {0}")]
    Transient(String),
    #[error("search request failed: {0}")]
    Permanent(String),
    #[error("malformed search response: {0}")]
    Decode(String),
}

impl SearchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SearchError::Transient(_))
    }
}

/// Either a direct place-id lookup or a free-text query with an optional
/// locality hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub place_id: Option<String>,
    pub text: Option<String>,
    pub locality: Option<String>,
}

impl SearchQuery {
    pub fn for_place_id(place_id: impl Into<String>) -> Self {
        Self {
            place_id: Some(place_id.into()),
            text: None,
            locality: None,
        }
    }

    pub fn for_text(text: impl Into<String>, locality: Option<String>) -> Self {
        Self {
            place_id: None,
            text: Some(text.into()),
            locality,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchHit {
    pub title: Option<String>,
    pub link: Option<String>,
    pub snippet: Option<String>,
    pub place_id: Option<String>,
}

/// External search lookup; `Ok(None)` means the API answered but had no
/// usable result.
#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn lookup(&self, query: &SearchQuery) -> Result<Option<SearchHit>, SearchError>;
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub endpoint: String,
    pub engine: String,
    pub timeout: Duration,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            endpoint: "https://serpapi.com/search".to_string(),
            engine: "google_maps".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

/// REST implementation of [`SearchApi`] over a query-string search
/// endpoint.
pub struct RestSearchApi {
    client: reqwest::Client,
    options: SearchOptions,
    api_key: String,
}

impl RestSearchApi {
    pub fn new(api_key: String, options: SearchOptions) -> anyhow::Result<Self> {
        let client = build_http_client(options.timeout, None)?;
        Ok(Self {
            client,
            options,
            api_key,
        })
    }
}

#[async_trait]
impl SearchApi for RestSearchApi {
    async fn lookup(&self, query: &SearchQuery) -> Result<Option<SearchHit>, SearchError> {
        let mut params: Vec<(&str, &str)> = vec![
            ("engine", self.options.engine.as_str()),
            ("api_key", self.api_key.as_str()),
        ];
        if let Some(place_id) = &query.place_id {
            params.push(("place_id", place_id.as_str()));
        } else if let Some(text) = &query.text {
            params.push(("q", text.as_str()));
        } else {
            return Ok(None);
        }
        if let Some(locality) = &query.locality {
            params.push(("location", locality.as_str()));
        }

        let response = self
            .client
            .get(&self.options.endpoint)
            .query(&params)
            .send()
            .await
            .map_err(|e| match ErrorClass::of_reqwest_error(&e) {
                ErrorClass::Transient => SearchError::Transient(e.to_string()),
                ErrorClass::Permanent => SearchError::Permanent(e.to_string()),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("status {status}: {body}");
            return Err(match ErrorClass::of_status(status) {
                ErrorClass::Transient => SearchError::Transient(message),
                ErrorClass::Permanent => SearchError::Permanent(message),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SearchError::Decode(e.to_string()))?;
        let hit = parse_search_hit(&body);
        if hit.is_none() {
            warn!(query = ?query.text, "search returned no usable result");
        }
        Ok(hit)
    }
}

/// Pulls the first matching key out of an arbitrarily nested response.
/// Provider payloads move fields around between engines, so the extraction
/// is structural rather than schema-bound.
fn first_key<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    match value {
        Value::Object(map) => keys
            .iter()
            .find_map(|k| map.get(*k))
            .or_else(|| map.values().find_map(|v| first_key(v, keys))),
        Value::Array(items) => items.iter().find_map(|v| first_key(v, keys)),
        _ => None,
    }
}

fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    match first_key(value, keys)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_search_hit(body: &Value) -> Option<SearchHit> {
    let hit = SearchHit {
        title: first_string(body, &["title", "name"]),
        link: first_string(body, &["link", "website", "url"]),
        snippet: first_string(body, &["snippet", "description", "about"]),
        place_id: first_string(body, &["place_id", "placeId", "data_id"]),
    };
    if hit.title.is_none() && hit.place_id.is_none() {
        None
    } else {
        Some(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn soql_always_selects_id_first() {
        let soql = build_soql(
            "Account",
            &["Name".to_string(), "Website".to_string()],
            None,
            None,
        );
        assert_eq!(soql, "SELECT Id, Name, Website FROM Account");
    }

    #[test]
    fn soql_with_id_filter_and_limit() {
        let ids = vec![RecordId::from("001A"), RecordId::from("001B")];
        let soql = build_soql("Account", &["Name".to_string()], Some(&ids), Some(10));
        assert_eq!(
            soql,
            "SELECT Id, Name FROM Account WHERE Id IN ('001A', '001B') LIMIT 10"
        );
    }

    #[test]
    fn soql_does_not_duplicate_an_id_projection() {
        let soql = build_soql("Account", &["Id".to_string(), "Name".to_string()], None, None);
        assert_eq!(soql, "SELECT Id, Name FROM Account");
    }

    #[test]
    fn invalid_field_error_is_classified_from_body() {
        let body = json!([
            {"message": "No such column 'Bogus__c'", "errorCode": "INVALID_FIELD"}
        ]);
        let err = classify_api_error(reqwest::StatusCode::BAD_REQUEST, &body);
        assert!(matches!(err, SourceError::InvalidField(_)));
    }

    #[test]
    fn unauthorized_maps_to_auth_error() {
        let err = classify_api_error(reqwest::StatusCode::UNAUTHORIZED, &Value::Null);
        assert!(matches!(err, SourceError::Auth(_)));
    }

    #[test]
    fn server_errors_are_transient() {
        let err = classify_api_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, &Value::Null);
        assert!(err.is_transient());
    }

    #[test]
    fn search_hit_extraction_walks_nested_payloads() {
        let body = json!({
            "search_metadata": {"status": "Success"},
            "place_results": {
                "title": "Blue Door Cafe",
                "place_id": "P-123",
                "website": "https://bluedoor.example",
                "description": "Neighborhood cafe"
            }
        });
        let hit = parse_search_hit(&body).expect("hit");
        assert_eq!(hit.title.as_deref(), Some("Blue Door Cafe"));
        assert_eq!(hit.place_id.as_deref(), Some("P-123"));
        assert_eq!(hit.link.as_deref(), Some("https://bluedoor.example"));
        assert_eq!(hit.snippet.as_deref(), Some("Neighborhood cafe"));
    }

    #[test]
    fn empty_payload_yields_no_hit() {
        assert!(parse_search_hit(&json!({"search_metadata": {}})).is_none());
    }

    #[test]
    fn credentials_prefer_password_grant() {
        let credentials = Credentials {
            login_url: DEFAULT_LOGIN_URL.to_string(),
            username: Some("ops@example.com".into()),
            password: Some("secret".into()),
            security_token: None,
            client_id: Some("key".into()),
            client_secret: Some("shh".into()),
        };
        assert_eq!(credentials.grant().unwrap(), AuthGrant::Password);
    }

    #[test]
    fn credentials_without_any_pair_are_rejected() {
        let credentials = Credentials {
            login_url: DEFAULT_LOGIN_URL.to_string(),
            username: Some("ops@example.com".into()),
            password: None,
            security_token: None,
            client_id: None,
            client_secret: None,
        };
        assert!(credentials.grant().is_err());
    }

    #[test]
    fn rows_without_an_identifier_are_dropped() {
        let record: serde_json::Map<String, Value> =
            serde_json::from_value(json!({"Name": "No Id Here"})).unwrap();
        assert!(record_row_from_json(record).is_none());

        let record: serde_json::Map<String, Value> = serde_json::from_value(
            json!({"attributes": {"type": "Account"}, "Id": "001A", "Name": "Kept"}),
        )
        .unwrap();
        let row = record_row_from_json(record).expect("row");
        assert_eq!(row.id, RecordId::from("001A"));
        assert!(!row.cells.contains_key("attributes"));
    }
}
