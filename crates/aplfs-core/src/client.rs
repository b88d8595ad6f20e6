//! Blocking HTTP client for the upstream query service.
//!
//! The service speaks JSON over HTTPS: dataset and field listings plus a
//! tabular APL query endpoint. Everything downstream of this module works
//! with the types defined here; tests substitute the [`QueryService`] trait.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A named, queryable collection in the upstream service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A column of a dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type", default)]
    pub ty: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
}

/// Result of an APL query in tabular form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub status: QueryStatus,
}

/// One table of a query result. Data is column-major: `columns[i]` holds the
/// values for `fields[i]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fields: Vec<TableField>,
    #[serde(default)]
    pub columns: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableField {
    pub name: String,
    #[serde(rename = "type", default)]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Aggregation {
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<serde_json::Value>,
}

impl Aggregation {
    /// Renders the aggregation as `op(field, arg, ...)` for schema output.
    pub fn render(&self) -> String {
        if self.fields.is_empty() && self.args.is_empty() {
            return self.op.clone();
        }
        let mut parts: Vec<String> = self.fields.clone();
        for arg in &self.args {
            parts.push(value_display(arg));
        }
        format!("{}({})", self.op, parts.join(", "))
    }
}

fn value_display(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueryStatus {
    #[serde(rename = "elapsedTime", default)]
    pub elapsed_time: i64,
    #[serde(rename = "blocksExamined", default)]
    pub blocks_examined: i64,
    #[serde(rename = "rowsExamined", default)]
    pub rows_examined: i64,
    #[serde(rename = "rowsMatched", default)]
    pub rows_matched: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// Upstream operations the engine depends on.
pub trait QueryService: Send + Sync {
    fn current_user(&self) -> Result<User>;
    fn list_datasets(&self) -> Result<Vec<Dataset>>;
    fn list_fields(&self, dataset: &str) -> Result<Vec<Field>>;
    fn query_apl(&self, apl: &str) -> Result<QueryResult>;
}

pub struct HttpClient {
    http: reqwest::blocking::Client,
    base_url: String,
    token: String,
    org: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    apl: &'a str,
}

impl HttpClient {
    pub fn new(base_url: &str, token: &str, org: &str) -> Result<Self> {
        if base_url.is_empty() {
            return Err(Error::Config("upstream url is required".to_string()));
        }
        if token.is_empty() {
            return Err(Error::Config("upstream token is required".to_string()));
        }
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| Error::Upstream(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            org: org.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::blocking::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json");
        if !self.org.is_empty() {
            builder = builder.header("X-Org-ID", &self.org);
        }
        builder
    }

    fn check(&self, response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        let message = match serde_json::from_str::<ApiError>(&body) {
            Ok(api) if !api.message.is_empty() => {
                format!("api error {}: {}", api.code, api.message)
            }
            _ => format!("api error: status {}", status.as_u16()),
        };
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Auth(message));
        }
        Err(Error::Upstream(message))
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .map_err(|err| Error::Upstream(err.to_string()))?;
        let response = self.check(response)?;
        response
            .json::<T>()
            .map_err(|err| Error::Upstream(err.to_string()))
    }
}

impl QueryService for HttpClient {
    fn current_user(&self) -> Result<User> {
        self.get_json("/v2/user")
    }

    fn list_datasets(&self) -> Result<Vec<Dataset>> {
        self.get_json("/v2/datasets")
    }

    fn list_fields(&self, dataset: &str) -> Result<Vec<Field>> {
        self.get_json(&format!("/v2/datasets/{dataset}/fields"))
    }

    fn query_apl(&self, apl: &str) -> Result<QueryResult> {
        let response = self
            .request(reqwest::Method::POST, "/v1/datasets/_apl?format=tabular")
            .json(&QueryRequest { apl })
            .send()
            .map_err(|err| Error::Upstream(err.to_string()))?;
        let response = self.check(response)?;
        response
            .json::<QueryResult>()
            .map_err(|err| Error::Upstream(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_url_and_token() {
        assert!(matches!(HttpClient::new("", "t", ""), Err(Error::Config(_))));
        assert!(matches!(
            HttpClient::new("https://api.example.com", "", ""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn aggregation_render_forms() {
        let plain = Aggregation {
            op: "count".to_string(),
            fields: vec![],
            args: vec![],
        };
        assert_eq!(plain.render(), "count");

        let with_args = Aggregation {
            op: "percentile".to_string(),
            fields: vec!["duration".to_string()],
            args: vec![serde_json::json!(95)],
        };
        assert_eq!(with_args.render(), "percentile(duration, 95)");
    }

    #[test]
    fn table_tolerates_missing_fields() {
        let result: QueryResult = serde_json::from_str(r#"{"tables":[{"name":"t"}]}"#).unwrap();
        assert_eq!(result.tables.len(), 1);
        assert!(result.tables[0].columns.is_empty());
    }
}
