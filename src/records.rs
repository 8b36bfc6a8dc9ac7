//! FHIR record sources and the text renderings built from them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

/// Resource types indexed and summarized by default, in display order.
pub const RESOURCE_TYPES: [&str; 12] = [
    "Patient",
    "Condition",
    "MedicationRequest",
    "Observation",
    "Encounter",
    "Practitioner",
    "Procedure",
    "AllergyIntolerance",
    "Immunization",
    "DiagnosticReport",
    "DocumentReference",
    "CarePlan",
];

/// Supplies the resources recorded for a subject (patient).
pub trait RecordSource: Send + Sync {
    /// Every resource of the subject, in source order.
    fn bundle(&self, subject_id: &str) -> Result<Vec<Value>>;

    /// Subject ids this source knows about.
    fn subject_ids(&self) -> Result<Vec<String>>;
}

/// Reads `Patient/{id}/$everything` from a FHIR R4 server.
pub struct FhirServerSource {
    client: Client,
    base: Url,
    max_pages: usize,
}

impl FhirServerSource {
    /// `base_url` is the FHIR endpoint root, e.g. `http://localhost:52773/fhir/r4`.
    pub fn new(base_url: &str, timeout: Duration, max_pages: usize) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("invalid FHIR base URL {base_url}"))?;
        anyhow::ensure!(
            matches!(base.scheme(), "http" | "https"),
            "FHIR base URL must be http(s)"
        );
        anyhow::ensure!(max_pages > 0, "max_pages must be positive");
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/fhir+json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build FHIR HTTP client")?;
        Ok(Self {
            client,
            base,
            max_pages,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("FHIR base URL cannot take path segments"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Follows `next` links until exhausted or `max_pages` pages were read.
    fn collect_pages(&self, first: Url) -> Result<Vec<Value>> {
        let mut resources = Vec::new();
        let mut next = Some(first);
        let mut pages = 0usize;
        while let Some(url) = next.take() {
            if pages == self.max_pages {
                warn!(pages, "FHIR page limit reached; remaining pages ignored");
                break;
            }
            pages += 1;
            debug!(%url, page = pages, "fetching FHIR page");
            let resp = self
                .client
                .get(url.clone())
                .send()
                .with_context(|| format!("failed to GET {url}"))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp
                    .text()
                    .unwrap_or_else(|_| "<body unavailable>".to_string());
                anyhow::bail!("FHIR server returned {} for {}: {}", status, url, body);
            }
            let page: Value = resp
                .json()
                .with_context(|| format!("failed to parse FHIR response from {url}"))?;
            next = next_link(&page)
                .map(|link| Url::parse(link).or_else(|_| url.join(link)))
                .transpose()
                .context("invalid next link in FHIR bundle")?;
            resources.extend(bundle_resources(page));
        }
        Ok(resources)
    }
}

impl RecordSource for FhirServerSource {
    fn bundle(&self, subject_id: &str) -> Result<Vec<Value>> {
        let url = self.endpoint(&["Patient", subject_id, "$everything"])?;
        let resources = self.collect_pages(url)?;
        info!(subject_id, resources = resources.len(), "fetched patient bundle");
        Ok(resources)
    }

    fn subject_ids(&self) -> Result<Vec<String>> {
        let mut url = self.endpoint(&["Patient"])?;
        url.query_pairs_mut().append_pair("_elements", "id");
        let patients = self.collect_pages(url)?;
        Ok(resources_of_type(&patients, "Patient")
            .into_iter()
            .filter_map(resource_id)
            .map(str::to_string)
            .collect())
    }
}

/// Reads bundles from disk: one file, or a directory of `<subject>.json` files.
pub struct BundleFileSource {
    path: PathBuf,
}

impl BundleFileSource {
    /// Source rooted at a file or directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(path: &Path) -> Result<Vec<Value>> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read bundle {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse bundle {}", path.display()))?;
        Ok(bundle_resources(value))
    }
}

impl RecordSource for BundleFileSource {
    fn bundle(&self, subject_id: &str) -> Result<Vec<Value>> {
        if self.path.is_dir() {
            Self::read(&self.path.join(format!("{subject_id}.json")))
        } else {
            Self::read(&self.path)
        }
    }

    fn subject_ids(&self) -> Result<Vec<String>> {
        if !self.path.is_dir() {
            let resources = Self::read(&self.path)?;
            return Ok(resources_of_type(&resources, "Patient")
                .into_iter()
                .filter_map(resource_id)
                .map(str::to_string)
                .collect());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.path)
            .with_context(|| format!("failed to list {}", self.path.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Resources held by a Bundle, a JSON array, or a single resource.
pub fn bundle_resources(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.into_iter().map(unwrap_entry).collect(),
        Value::Object(mut map) if map.get("resourceType").and_then(Value::as_str) == Some("Bundle") => {
            match map.remove("entry") {
                Some(Value::Array(entries)) => entries.into_iter().map(unwrap_entry).collect(),
                _ => Vec::new(),
            }
        }
        Value::Object(map) => vec![Value::Object(map)],
        _ => Vec::new(),
    }
}

fn unwrap_entry(entry: Value) -> Value {
    match entry {
        Value::Object(mut map) if map.contains_key("resource") => {
            map.remove("resource").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn next_link(page: &Value) -> Option<&str> {
    page.get("link")?
        .as_array()?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))?
        .get("url")?
        .as_str()
}

/// Resources whose `resourceType` equals `resource_type`.
pub fn resources_of_type<'a>(resources: &'a [Value], resource_type: &str) -> Vec<&'a Value> {
    resources
        .iter()
        .filter(|resource| resource.get("resourceType").and_then(Value::as_str) == Some(resource_type))
        .collect()
}

/// `id` of a resource, when present.
pub fn resource_id(resource: &Value) -> Option<&str> {
    resource.get("id").and_then(Value::as_str)
}

/// Renders a resource as `Key: Sub: value` lines.
///
/// Keys are capitalized (first letter upper, rest lower); list items are
/// flattened under their parent key.
pub fn flatten_resource(resource: &Value) -> String {
    let mut lines = Vec::new();
    flatten_into(resource, String::new(), &mut lines);
    lines.join("\n")
}

fn flatten_into(value: &Value, prefix: String, lines: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(child, format!("{prefix}{}: ", capitalize(key)), lines);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_into(item, prefix.clone(), lines);
            }
        }
        Value::String(text) => lines.push(format!("{prefix}{text}")),
        scalar => lines.push(format!("{prefix}{scalar}")),
    }
}

fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Pretty JSON of every resource, one after another.
pub fn bundle_text(resources: &[Value]) -> String {
    resources
        .iter()
        .map(|resource| serde_json::to_string_pretty(resource).unwrap_or_else(|_| resource.to_string()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flatten_capitalizes_keys_and_inlines_lists() {
        let resource = json!({
            "resourceType": "Condition",
            "onsetAge": 12,
            "code": {"coding": [{"display": "Asthma"}, {"display": "Wheeze"}]}
        });
        let flat = flatten_resource(&resource);
        assert_eq!(
            flat,
            "Resourcetype: Condition\nOnsetage: 12\nCode: Coding: Display: Asthma\nCode: Coding: Display: Wheeze"
        );
    }

    #[test]
    fn bundle_shapes_are_unwrapped() {
        let bundle = json!({
            "resourceType": "Bundle",
            "entry": [{"resource": {"resourceType": "Patient", "id": "p1"}}]
        });
        assert_eq!(bundle_resources(bundle).len(), 1);
        let array = json!([{"resourceType": "Condition", "id": "c1"}, {"resource": {"resourceType": "Condition", "id": "c2"}}]);
        let resources = bundle_resources(array);
        assert_eq!(resources_of_type(&resources, "Condition").len(), 2);
        assert_eq!(resource_id(&resources[1]), Some("c2"));
    }

    #[test]
    fn next_link_is_found() {
        let page = json!({"link": [{"relation": "self", "url": "a"}, {"relation": "next", "url": "b"}]});
        assert_eq!(next_link(&page), Some("b"));
        assert_eq!(next_link(&json!({})), None);
    }

    #[test]
    fn everything_endpoint_keeps_base_path() {
        let source = FhirServerSource::new("http://localhost:52773/fhir/r4/", Duration::from_secs(1), 3).unwrap();
        let url = source.endpoint(&["Patient", "2", "$everything"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:52773/fhir/r4/Patient/2/$everything");
        assert!(FhirServerSource::new("ftp://x", Duration::from_secs(1), 3).is_err());
    }

    #[test]
    fn bundle_text_is_pretty_json() {
        let text = bundle_text(&[json!({"id": "a"}), json!({"id": "b"})]);
        assert_eq!(text, "{\n  \"id\": \"a\"\n}\n{\n  \"id\": \"b\"\n}");
    }
}
