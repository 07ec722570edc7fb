//! GitHub Projects (v2) board as the work-item source.
//!
//! Items are issues of one repository placed on one project. Status is a
//! single-select field, the claim is a text field, comments go on the issue.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::{Config, FieldsConfig};
use crate::error::{ExitError, SourceError};
use crate::model::{FieldValue, Status, WorkItem};
use crate::subprocess::Tool;

use super::{StatusMap, WorkItemSource, dedup_items};

const DEFAULT_API_URL: &str = "https://api.github.com";

/// Upper bound on pages fetched per listing (100 items each).
const MAX_PAGES: usize = 50;

const ITEM_FIELDS: &str = r"
fragment ItemFields on ProjectV2Item {
  id
  project { number }
  content {
    __typename
    ... on Issue {
      number
      title
      body
      labels(first: 50) { nodes { name } }
      repository { nameWithOwner }
    }
  }
  fieldValues(first: 30) {
    nodes {
      __typename
      ... on ProjectV2ItemFieldTextValue {
        text
        field { ... on ProjectV2FieldCommon { name } }
      }
      ... on ProjectV2ItemFieldSingleSelectValue {
        name
        optionId
        field { ... on ProjectV2FieldCommon { name } }
      }
      ... on ProjectV2ItemFieldNumberValue {
        number
        field { ... on ProjectV2FieldCommon { name } }
      }
      ... on ProjectV2ItemFieldIterationValue {
        title
        iterationId
        startDate
        field { ... on ProjectV2FieldCommon { name } }
      }
    }
  }
}
";

const ITEMS_QUERY: &str = r"
query($owner: String!, $number: Int!, $cursor: String) {
  repositoryOwner(login: $owner) {
    ... on ProjectV2Owner {
      projectV2(number: $number) {
        items(first: 100, after: $cursor) {
          pageInfo { hasNextPage endCursor }
          nodes { ...ItemFields }
        }
      }
    }
  }
}
";

const ISSUE_QUERY: &str = r"
query($owner: String!, $repo: String!, $issue: Int!) {
  repository(owner: $owner, name: $repo) {
    issue(number: $issue) {
      projectItems(first: 20) { nodes { ...ItemFields } }
    }
  }
}
";

const META_QUERY: &str = r"
query($owner: String!, $number: Int!) {
  repositoryOwner(login: $owner) {
    ... on ProjectV2Owner {
      projectV2(number: $number) {
        id
        fields(first: 50) {
          nodes {
            __typename
            ... on ProjectV2FieldCommon { id name }
            ... on ProjectV2SingleSelectField { options { id name } }
          }
        }
      }
    }
  }
}
";

const SET_OPTION_MUTATION: &str = r"
mutation($project: ID!, $item: ID!, $field: ID!, $option: String!) {
  updateProjectV2ItemFieldValue(input: {
    projectId: $project, itemId: $item, fieldId: $field,
    value: { singleSelectOptionId: $option }
  }) { projectV2Item { id } }
}
";

const SET_TEXT_MUTATION: &str = r"
mutation($project: ID!, $item: ID!, $field: ID!, $text: String!) {
  updateProjectV2ItemFieldValue(input: {
    projectId: $project, itemId: $item, fieldId: $field,
    value: { text: $text }
  }) { projectV2Item { id } }
}
";

const CLEAR_MUTATION: &str = r"
mutation($project: ID!, $item: ID!, $field: ID!) {
  clearProjectV2ItemFieldValue(input: {
    projectId: $project, itemId: $item, fieldId: $field
  }) { projectV2Item { id } }
}
";

// --- wire types ---

#[derive(Debug, Deserialize)]
struct Connection<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<Option<T>>,
}

impl<T> Connection<T> {
    fn into_nodes(self) -> impl Iterator<Item = T> {
        self.nodes.into_iter().flatten()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemsPage {
    page_info: PageInfo,
    nodes: Vec<Option<ItemNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemNode {
    id: String,
    #[serde(default)]
    project: Option<ProjectRef>,
    content: Option<Content>,
    field_values: Connection<FieldValueNode>,
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    number: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "__typename")]
enum Content {
    Issue(IssueContent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueContent {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    labels: Option<Connection<NameNode>>,
    repository: RepositoryRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryRef {
    name_with_owner: String,
}

#[derive(Debug, Deserialize)]
struct NameNode {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "__typename")]
enum FieldValueNode {
    #[serde(rename = "ProjectV2ItemFieldTextValue")]
    Text(TextValue),
    #[serde(rename = "ProjectV2ItemFieldSingleSelectValue")]
    SingleSelect(SingleSelectValue),
    #[serde(rename = "ProjectV2ItemFieldNumberValue")]
    Number(NumberValue),
    #[serde(rename = "ProjectV2ItemFieldIterationValue")]
    Iteration(IterationValue),
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct TextValue {
    text: Option<String>,
    field: Option<NameNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SingleSelectValue {
    name: Option<String>,
    option_id: Option<String>,
    field: Option<NameNode>,
}

#[derive(Debug, Deserialize)]
struct NumberValue {
    number: Option<f64>,
    field: Option<NameNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IterationValue {
    title: Option<String>,
    iteration_id: Option<String>,
    start_date: Option<String>,
    field: Option<NameNode>,
}

impl FieldValueNode {
    /// Field name and typed value, or None for unsupported or empty values.
    fn decode(self) -> Option<(String, FieldValue)> {
        fn field_name(field: Option<NameNode>) -> Option<String> {
            field.and_then(|f| f.name)
        }
        match self {
            Self::Text(v) => Some((field_name(v.field)?, FieldValue::Text(v.text?))),
            Self::SingleSelect(v) => Some((
                field_name(v.field)?,
                FieldValue::SingleSelect {
                    option_id: v.option_id.unwrap_or_default(),
                    name: v.name?,
                },
            )),
            Self::Number(v) => Some((field_name(v.field)?, FieldValue::Number(v.number?))),
            Self::Iteration(v) => Some((
                field_name(v.field)?,
                FieldValue::Iteration {
                    iteration_id: v.iteration_id.unwrap_or_default(),
                    title: v.title?,
                    start_date: v.start_date,
                },
            )),
            Self::Unsupported => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProjectFields {
    id: String,
    fields: Connection<FieldMeta>,
}

#[derive(Debug, Deserialize)]
struct FieldMeta {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    options: Vec<OptionMeta>,
}

#[derive(Debug, Clone, Deserialize)]
struct OptionMeta {
    id: String,
    name: String,
}

fn decode<T: serde::de::DeserializeOwned>(what: &'static str, value: Value) -> Result<T, SourceError> {
    serde_json::from_value(value).map_err(|e| SourceError::Decode {
        what,
        detail: e.to_string(),
    })
}

fn pointer(value: &Value, path: &str, what: &'static str) -> Result<Value, SourceError> {
    match value.pointer(path) {
        Some(Value::Null) | None => Err(SourceError::Decode {
            what,
            detail: format!("response has no {path}"),
        }),
        Some(v) => Ok(v.clone()),
    }
}

// --- transport ---

/// Minimal GitHub API client: GraphQL for the project, REST for comments.
pub struct GithubApi {
    agent: ureq::Agent,
    token: String,
    api_url: String,
}

impl GithubApi {
    pub fn new(token: &str, api_url: &str) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(30)))
            .build();
        Self {
            agent: config.into(),
            token: token.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Token from `GITHUB_TOKEN`, `GH_TOKEN`, or `gh auth token`.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_url = std::env::var("GITHUB_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.into());
        let from_var = ["GITHUB_TOKEN", "GH_TOKEN"]
            .iter()
            .filter_map(|k| std::env::var(k).ok())
            .find(|t| !t.trim().is_empty());
        let token = match from_var {
            Some(t) => t,
            None => {
                let out = Tool::new("gh")
                    .args(&["auth", "token"])
                    .timeout(Duration::from_secs(10))
                    .run_ok()
                    .map_err(|e| {
                        ExitError::Config(format!(
                            "no GitHub token: set GITHUB_TOKEN or log in with `gh auth login` ({e})"
                        ))
                    })?;
                out.stdout.trim().to_string()
            }
        };
        Ok(Self::new(&token, &api_url))
    }

    fn post(&self, path: &str, body: &Value) -> Result<String, SourceError> {
        let endpoint = format!("{}{path}", self.api_url);
        let response = self
            .agent
            .post(&endpoint)
            .header("Authorization", &format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", concat!("foreman/", env!("CARGO_PKG_VERSION")))
            .header("Content-Type", "application/json")
            .send(body.to_string())
            .map_err(|e| match e {
                ureq::Error::StatusCode(code) => SourceError::Api {
                    endpoint: path.to_string(),
                    detail: format!("HTTP {code}"),
                },
                other => SourceError::Transport {
                    endpoint: path.to_string(),
                    detail: other.to_string(),
                },
            })?;
        response
            .into_body()
            .read_to_string()
            .map_err(|e| SourceError::Transport {
                endpoint: path.to_string(),
                detail: e.to_string(),
            })
    }

    /// Run a GraphQL operation and return its `data`.
    pub fn graphql(&self, query: &str, variables: Value) -> Result<Value, SourceError> {
        let body = json!({ "query": query, "variables": variables });
        let text = self.post("/graphql", &body)?;
        let response: Value = serde_json::from_str(&text).map_err(|e| SourceError::Decode {
            what: "graphql response",
            detail: e.to_string(),
        })?;
        graphql_data(response)
    }

    pub fn post_rest(&self, path: &str, body: &Value) -> Result<(), SourceError> {
        self.post(path, body).map(|_| ())
    }
}

/// Split a GraphQL response into data or the error messages it carries.
fn graphql_data(mut response: Value) -> Result<Value, SourceError> {
    if let Some(errors) = response.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let detail = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(SourceError::Api {
                endpoint: "/graphql".into(),
                detail,
            });
        }
    }
    match response.get_mut("data").map(Value::take) {
        Some(Value::Null) | None => Err(SourceError::Decode {
            what: "graphql response",
            detail: "no data".into(),
        }),
        Some(data) => Ok(data),
    }
}

// --- decoding ---

/// Turns project items into work items for one repository.
#[derive(Debug, Clone)]
pub struct ItemDecoder {
    repository: String,
    project_number: u64,
    fields: FieldsConfig,
    statuses: StatusMap,
}

impl ItemDecoder {
    pub fn new(repository: &str, project_number: u64, fields: FieldsConfig, statuses: StatusMap) -> Self {
        Self {
            repository: repository.to_string(),
            project_number,
            fields,
            statuses,
        }
    }

    /// Items on other repositories, draft items and items in a column we
    /// have no mapping for are skipped.
    fn decode(&self, node: ItemNode) -> Option<WorkItem> {
        let Some(Content::Issue(issue)) = node.content else {
            return None;
        };
        if !issue
            .repository
            .name_with_owner
            .eq_ignore_ascii_case(&self.repository)
        {
            return None;
        }

        let values: Vec<(String, FieldValue)> = node
            .field_values
            .into_nodes()
            .filter_map(FieldValueNode::decode)
            .collect();
        let field = |name: &str| {
            values
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        };

        let status = match field(&self.fields.status) {
            Some(FieldValue::SingleSelect { name, .. }) => self.statuses.parse(name),
            _ => None,
        };
        let Some(status) = status else {
            tracing::debug!(item = issue.number, "skipping item without a mapped status");
            return None;
        };
        let claimed_by = field(&self.fields.claimed_by)
            .and_then(FieldValue::as_text)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        let provider = field(&self.fields.provider)
            .and_then(FieldValue::as_text)
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty());

        let labels: Vec<String> = issue
            .labels
            .map(|c| c.into_nodes().filter_map(|l| l.name).collect())
            .unwrap_or_default();
        let has_label = |wanted: &str| labels.iter().any(|l| l.eq_ignore_ascii_case(wanted));
        let exclusive = has_label(&self.fields.exclusive_label);
        let coordinator = has_label(&self.fields.coordinator_label);

        Some(WorkItem {
            id: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            status,
            claimed_by,
            labels,
            provider,
            exclusive,
            coordinator,
            project_item: Some(node.id),
        })
    }

    /// One page of the project listing: decoded items and the next cursor.
    fn decode_page(&self, data: Value) -> Result<(Vec<WorkItem>, Option<String>), SourceError> {
        let page: ItemsPage = decode(
            "project items",
            pointer(&data, "/repositoryOwner/projectV2/items", "project items")?,
        )?;
        let items = page
            .nodes
            .into_iter()
            .flatten()
            .filter_map(|n| self.decode(n))
            .collect();
        let next = if page.page_info.has_next_page {
            page.page_info.end_cursor
        } else {
            None
        };
        Ok((items, next))
    }

    /// The item for this project among an issue's project entries.
    fn decode_issue(&self, id: u64, data: Value) -> Result<WorkItem, SourceError> {
        let Some(entries) = data.pointer("/repository/issue/projectItems") else {
            return Err(SourceError::NotFound(id));
        };
        if entries.is_null() {
            return Err(SourceError::NotFound(id));
        }
        let entries: Connection<ItemNode> = decode("issue project items", entries.clone())?;
        entries
            .into_nodes()
            .filter(|n| n.project.as_ref().is_some_and(|p| p.number == self.project_number))
            .find_map(|n| self.decode(n))
            .ok_or(SourceError::NotFound(id))
    }
}

/// Ids the board needs for writes, looked up once.
#[derive(Debug, Clone)]
struct ProjectMeta {
    project_id: String,
    status_field_id: String,
    status_options: Vec<OptionMeta>,
    claim_field_id: String,
}

fn decode_meta(data: Value, fields: &FieldsConfig) -> Result<ProjectMeta, SourceError> {
    let project: ProjectFields = decode(
        "project fields",
        pointer(&data, "/repositoryOwner/projectV2", "project fields")?,
    )?;
    let all: Vec<FieldMeta> = project.fields.into_nodes().collect();
    let find = |name: &str| {
        all.iter()
            .find(|f| f.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .and_then(|f| f.id.clone().map(|id| (id, f.options.clone())))
            .ok_or_else(|| SourceError::MissingField {
                kind: "field",
                name: name.to_string(),
            })
    };
    let (status_field_id, status_options) = find(&fields.status)?;
    let (claim_field_id, _) = find(&fields.claimed_by)?;
    Ok(ProjectMeta {
        project_id: project.id,
        status_field_id,
        status_options,
        claim_field_id,
    })
}

// --- the source ---

/// A GitHub Projects v2 board scoped to one repository's issues.
pub struct ProjectBoard {
    api: GithubApi,
    owner: String,
    repo: String,
    project_number: u64,
    decoder: ItemDecoder,
    statuses: StatusMap,
    meta: Option<ProjectMeta>,
    item_ids: HashMap<u64, String>,
}

impl ProjectBoard {
    pub fn new(api: GithubApi, config: &Config) -> Self {
        let statuses = StatusMap::from_config(&config.status_map);
        let repository = format!("{}/{}", config.project.owner, config.project.repo);
        Self {
            api,
            owner: config.project.owner.clone(),
            repo: config.project.repo.clone(),
            project_number: config.project.project_number,
            decoder: ItemDecoder::new(
                &repository,
                config.project.project_number,
                config.fields.clone(),
                statuses.clone(),
            ),
            statuses,
            meta: None,
            item_ids: HashMap::new(),
        }
    }

    fn meta(&mut self) -> Result<ProjectMeta, SourceError> {
        if let Some(meta) = &self.meta {
            return Ok(meta.clone());
        }
        let data = self.api.graphql(
            META_QUERY,
            json!({ "owner": self.owner, "number": self.project_number }),
        )?;
        let meta = decode_meta(data, &self.decoder.fields)?;
        self.meta = Some(meta.clone());
        Ok(meta)
    }

    fn item_id(&mut self, id: u64) -> Result<String, SourceError> {
        if let Some(item) = self.item_ids.get(&id) {
            return Ok(item.clone());
        }
        self.fetch_by_id(id)?
            .project_item
            .ok_or(SourceError::NotFound(id))
    }

    fn remember(&mut self, items: &[WorkItem]) {
        for item in items {
            if let Some(handle) = &item.project_item {
                self.item_ids.insert(item.id, handle.clone());
            }
        }
    }

    fn fetch_all(&mut self) -> Result<Vec<WorkItem>, SourceError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let data = self.api.graphql(
                &format!("{ITEMS_QUERY}{ITEM_FIELDS}"),
                json!({ "owner": self.owner, "number": self.project_number, "cursor": cursor }),
            )?;
            let (page, next) = self.decoder.decode_page(data)?;
            items.extend(page);
            match next {
                Some(c) => cursor = Some(c),
                None => return Ok(items),
            }
        }
        tracing::warn!(pages = MAX_PAGES, "project listing truncated");
        Ok(items)
    }
}

impl WorkItemSource for ProjectBoard {
    fn fetch_eligible(&mut self, statuses: &[Status]) -> Result<Vec<WorkItem>, SourceError> {
        let items = self.fetch_all()?;
        self.remember(&items);
        Ok(dedup_items(
            items
                .into_iter()
                .filter(|i| statuses.contains(&i.status))
                .collect(),
        ))
    }

    fn fetch_by_id(&mut self, id: u64) -> Result<WorkItem, SourceError> {
        let data = self.api.graphql(
            &format!("{ISSUE_QUERY}{ITEM_FIELDS}"),
            json!({ "owner": self.owner, "repo": self.repo, "issue": id }),
        )?;
        let item = self.decoder.decode_issue(id, data)?;
        self.remember(std::slice::from_ref(&item));
        Ok(item)
    }

    fn set_status(&mut self, id: u64, status: Status) -> Result<(), SourceError> {
        let meta = self.meta()?;
        let label = self.statuses.label(status).unwrap_or(status.as_str());
        let option = meta
            .status_options
            .iter()
            .find(|o| o.name.eq_ignore_ascii_case(label))
            .ok_or_else(|| SourceError::MissingField {
                kind: "status option",
                name: label.to_string(),
            })?;
        let item = self.item_id(id)?;
        self.api.graphql(
            SET_OPTION_MUTATION,
            json!({
                "project": meta.project_id,
                "item": item,
                "field": meta.status_field_id,
                "option": option.id,
            }),
        )?;
        tracing::debug!(item = id, %status, "board status set");
        Ok(())
    }

    fn set_claim(&mut self, id: u64, token: Option<&str>) -> Result<(), SourceError> {
        let meta = self.meta()?;
        let item = self.item_id(id)?;
        match token {
            Some(token) => self.api.graphql(
                SET_TEXT_MUTATION,
                json!({
                    "project": meta.project_id,
                    "item": item,
                    "field": meta.claim_field_id,
                    "text": token,
                }),
            )?,
            None => self.api.graphql(
                CLEAR_MUTATION,
                json!({
                    "project": meta.project_id,
                    "item": item,
                    "field": meta.claim_field_id,
                }),
            )?,
        };
        Ok(())
    }

    fn get_claim(&mut self, id: u64) -> Result<Option<String>, SourceError> {
        Ok(self.fetch_by_id(id)?.claimed_by)
    }

    fn comment(&mut self, id: u64, body: &str) -> Result<(), SourceError> {
        let path = format!("/repos/{}/{}/issues/{id}/comments", self.owner, self.repo);
        self.api.post_rest(&path, &json!({ "body": body }))
    }
}
