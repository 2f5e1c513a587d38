//! A small, purpose-built Amazon Glacier client: AWS Signature Version 4
//! signing plus the handful of Glacier REST endpoints this crate needs
//! (multipart upload, job management, archive deletion).
//!
//! This is intentionally not a general AWS SDK. Glacier's SigV4 variant also
//! requires the non-standard `x-amz-glacier-version` header and expects
//! tree-hash headers on multipart operations, so a general-purpose HTTP
//! signer would not save much.

use std::collections::BTreeMap;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::Error;

const GLACIER_API_VERSION: &str = "2012-06-01";
const SERVICE: &str = "glacier";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct GlacierClient {
    http: reqwest::Client,
    region: String,
    account_id: String,
    vault_name: String,
    access_key: String,
    secret_access_key: String,
    /// Overrides `endpoint()`'s `https://glacier.<region>.amazonaws.com`
    /// scheme+host. Only ever set by tests, to point at a local mock server.
    endpoint_override: Option<String>,
}

/// One archive or inventory retrieval job, as reported by `ListJobs` or
/// `DescribeJob`.
#[derive(Debug, Clone, Deserialize)]
pub struct GlacierJob {
    #[serde(rename = "JobId")]
    pub job_id: String,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "ArchiveId")]
    pub archive_id: Option<String>,
    #[serde(rename = "Completed")]
    pub completed: bool,
    #[serde(rename = "StatusCode")]
    pub status_code: String,
    #[serde(rename = "CreationDate")]
    pub creation_date: String,
    #[serde(rename = "CompletionDate")]
    pub completion_date: Option<String>,
    #[serde(rename = "SHA256TreeHash")]
    pub sha256_tree_hash: Option<String>,
}

impl GlacierJob {
    pub fn is_inventory_retrieval(&self) -> bool {
        self.action == "InventoryRetrieval"
    }

    pub fn is_archive_retrieval(&self) -> bool {
        self.action == "ArchiveRetrieval"
    }

    pub fn completed_successfully(&self) -> bool {
        self.completed && self.status_code == "Succeeded"
    }

    pub fn is_pending(&self) -> bool {
        !self.completed
    }
}

#[derive(Deserialize)]
struct ListJobsResponse {
    #[serde(rename = "JobList")]
    job_list: Vec<GlacierJob>,
}

#[derive(Deserialize)]
struct ListPartsResponse {
    #[serde(rename = "Parts")]
    parts: Vec<PartListing>,
    #[serde(rename = "Marker")]
    marker: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartListing {
    #[serde(rename = "RangeInBytes")]
    pub range_in_bytes: String,
    #[serde(rename = "SHA256TreeHash")]
    pub sha256_tree_hash: String,
}

impl GlacierClient {
    pub fn new(
        region: impl Into<String>,
        account_id: impl Into<String>,
        vault_name: impl Into<String>,
        access_key: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            region: region.into(),
            account_id: account_id.into(),
            vault_name: vault_name.into(),
            access_key: access_key.into(),
            secret_access_key: secret_access_key.into(),
            endpoint_override: None,
        })
    }

    /// Point this client at a local mock server instead of the real Glacier
    /// endpoint. Requests are still SigV4-signed against `region`, but no
    /// server is expected to verify that signature.
    #[cfg(test)]
    pub(crate) fn with_endpoint_override(mut self, base_url: impl Into<String>) -> Self {
        self.endpoint_override = Some(base_url.into());
        self
    }

    fn endpoint(&self) -> String {
        self.endpoint_override
            .clone()
            .unwrap_or_else(|| format!("https://glacier.{}.amazonaws.com", self.region))
    }

    fn host(&self) -> String {
        format!("glacier.{}.amazonaws.com", self.region)
    }

    fn vault_path(&self) -> String {
        format!("/{}/vaults/{}", self.account_id, self.vault_name)
    }

    /// Initiate a multipart upload. Returns the upload id.
    pub async fn initiate_multipart_upload(
        &self,
        part_size: u64,
        description: &str,
    ) -> Result<String, Error> {
        let path = format!("{}/multipart-uploads", self.vault_path());
        let mut headers = BTreeMap::new();
        headers.insert("x-amz-part-size".to_string(), part_size.to_string());
        headers.insert("x-amz-archive-description".to_string(), description.to_string());

        let response = self.signed_request(reqwest::Method::POST, &path, headers, &[]).await?;
        let response = expect_status(response, 201).await?;
        header_value(&response, "x-amz-multipart-upload-id")
    }

    /// Upload one part. `range` is the byte range `[start, end)` within the
    /// final archive that `data` occupies.
    pub async fn upload_part(
        &self,
        upload_id: &str,
        range: (u64, u64),
        tree_hash: &str,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        let path = format!("{}/multipart-uploads/{}", self.vault_path(), upload_id);
        let payload_hash = hex::encode(Sha256::digest(&data));
        let mut headers = BTreeMap::new();
        headers.insert("x-amz-sha256-tree-hash".to_string(), tree_hash.to_string());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash);
        headers.insert(
            "Content-Range".to_string(),
            format!("bytes {}-{}/*", range.0, range.1.saturating_sub(1)),
        );

        let response = self.signed_request_with_method_and_body(
            reqwest::Method::PUT,
            &path,
            headers,
            data,
        ).await?;
        expect_status(response, 204).await?;
        Ok(())
    }

    /// Complete a multipart upload, declaring the final size and tree hash.
    /// Returns the resulting archive id.
    pub async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        archive_size: u64,
        tree_hash: &str,
    ) -> Result<String, Error> {
        let path = format!("{}/multipart-uploads/{}", self.vault_path(), upload_id);
        let mut headers = BTreeMap::new();
        headers.insert("x-amz-sha256-tree-hash".to_string(), tree_hash.to_string());
        headers.insert("x-amz-archive-size".to_string(), archive_size.to_string());

        let response = self.signed_request(reqwest::Method::POST, &path, headers, &[]).await?;
        let response = expect_status(response, 201).await?;

        let reported_tree_hash = header_value(&response, "x-amz-sha256-tree-hash")?;
        if reported_tree_hash != tree_hash {
            return Err(Error::TreeHashMismatch);
        }
        header_value(&response, "x-amz-archive-id")
    }

    pub async fn abort_multipart_upload(&self, upload_id: &str) -> Result<(), Error> {
        let path = format!("{}/multipart-uploads/{}", self.vault_path(), upload_id);
        let response = self
            .signed_request(reqwest::Method::DELETE, &path, BTreeMap::new(), &[])
            .await?;
        expect_status(response, 204).await?;
        Ok(())
    }

    pub async fn list_parts(&self, upload_id: &str) -> Result<Vec<PartListing>, Error> {
        let mut all = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let path = match &marker {
                Some(m) => format!(
                    "{}/multipart-uploads/{}?marker={}",
                    self.vault_path(),
                    upload_id,
                    m
                ),
                None => format!("{}/multipart-uploads/{}", self.vault_path(), upload_id),
            };
            let response = self.signed_request(reqwest::Method::GET, &path, BTreeMap::new(), &[]).await?;
            let response = expect_status(response, 200).await?;
            let body: ListPartsResponse = response.json().await?;
            all.extend(body.parts);
            marker = body.marker;
            if marker.is_none() {
                break;
            }
        }
        Ok(all)
    }

    /// Upload a whole archive in one request; only suitable for small
    /// archives such as the kv-pack catalog/index container.
    pub async fn upload_archive(&self, description: &str, data: Vec<u8>) -> Result<String, Error> {
        let path = format!("{}/archives", self.vault_path());
        let tree_hash = hex::encode(crate::treehash::tree_hash_of(&data));
        let payload_hash = hex::encode(Sha256::digest(&data));
        let mut headers = BTreeMap::new();
        headers.insert("x-amz-archive-description".to_string(), description.to_string());
        headers.insert("x-amz-sha256-tree-hash".to_string(), tree_hash);
        headers.insert("x-amz-content-sha256".to_string(), payload_hash);

        let response = self
            .signed_request_with_method_and_body(reqwest::Method::POST, &path, headers, data)
            .await?;
        let response = expect_status(response, 201).await?;
        header_value(&response, "x-amz-archive-id")
    }

    pub async fn delete_archive(&self, archive_id: &str) -> Result<(), Error> {
        let path = format!("{}/archives/{}", self.vault_path(), archive_id);
        let response = self
            .signed_request(reqwest::Method::DELETE, &path, BTreeMap::new(), &[])
            .await?;
        expect_status(response, 204).await?;
        Ok(())
    }

    pub async fn initiate_inventory_retrieval(&self) -> Result<String, Error> {
        let path = format!("{}/jobs", self.vault_path());
        let body = serde_json::json!({ "Type": "inventory-retrieval" });
        let payload = serde_json::to_vec(&body)?;
        let response = self
            .signed_request_with_method_and_body(reqwest::Method::POST, &path, BTreeMap::new(), payload)
            .await?;
        let response = expect_status(response, 202).await?;
        header_value(&response, "x-amz-job-id")
    }

    pub async fn initiate_archive_retrieval(&self, archive_id: &str) -> Result<String, Error> {
        let path = format!("{}/jobs", self.vault_path());
        let body = serde_json::json!({ "Type": "archive-retrieval", "ArchiveId": archive_id });
        let payload = serde_json::to_vec(&body)?;
        let response = self
            .signed_request_with_method_and_body(reqwest::Method::POST, &path, BTreeMap::new(), payload)
            .await?;
        let response = expect_status(response, 202).await?;
        header_value(&response, "x-amz-job-id")
    }

    pub async fn list_jobs(&self) -> Result<Vec<GlacierJob>, Error> {
        let path = format!("{}/jobs", self.vault_path());
        let response = self.signed_request(reqwest::Method::GET, &path, BTreeMap::new(), &[]).await?;
        let response = expect_status(response, 200).await?;
        let body: ListJobsResponse = response.json().await?;
        Ok(body.job_list)
    }

    /// Fetch a completed job's output, optionally restricted to a byte
    /// range (used to page through a large inventory or archive retrieval).
    pub async fn get_job_output(
        &self,
        job_id: &str,
        range: Option<(u64, u64)>,
    ) -> Result<bytes::Bytes, Error> {
        let path = format!("{}/jobs/{}/output", self.vault_path(), job_id);
        let mut headers = BTreeMap::new();
        if let Some((start, end)) = range {
            headers.insert("Range".to_string(), format!("bytes={}-{}", start, end));
        }
        let response = self.signed_request(reqwest::Method::GET, &path, headers, &[]).await?;
        let response = expect_status_one_of(response, &[200, 206]).await?;
        Ok(response.bytes().await?)
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        extra_headers: BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<reqwest::Response, Error> {
        self.signed_request_with_method_and_body(method, path, extra_headers, body.to_vec())
            .await
    }

    async fn signed_request_with_method_and_body(
        &self,
        method: reqwest::Method,
        path: &str,
        extra_headers: BTreeMap<String, String>,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, Error> {
        let (canonical_path, query_string) = split_path_and_query(path);
        let now = chrono::Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let payload_hash = hex::encode(Sha256::digest(&body));

        let mut headers = extra_headers;
        headers.insert("host".to_string(), self.host());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert("x-amz-glacier-version".to_string(), GLACIER_API_VERSION.to_string());
        if !headers.contains_key("x-amz-content-sha256") {
            headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        }

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k.to_lowercase(), v.trim()))
            .collect();
        let signed_headers: String = headers
            .keys()
            .map(|k| k.to_lowercase())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_path,
            query_string,
            canonical_headers,
            signed_headers,
            payload_hash,
        );

        let credential_scope = format!("{}/{}/{}/aws4_request", date_stamp, self.region, SERVICE);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes())),
        );

        let signing_key = derive_signing_key(&self.secret_access_key, &date_stamp, &self.region);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, credential_scope, signed_headers, signature
        );

        let url = format!("{}{}", self.endpoint(), path);
        let mut request = self.http.request(method, url).body(body);
        for (key, value) in &headers {
            if key == "host" {
                continue; // reqwest sets this from the URL
            }
            request = request.header(key.as_str(), value.as_str());
        }
        request = request.header("Authorization", authorization);

        Ok(request.send().await?)
    }
}

fn split_path_and_query(path: &str) -> (String, String) {
    match path.split_once('?') {
        Some((p, q)) => (p.to_string(), canonicalize_query(q)),
        None => (path.to_string(), String::new()),
    }
}

fn canonicalize_query(query: &str) -> String {
    let mut pairs: Vec<&str> = query.split('&').filter(|s| !s.is_empty()).collect();
    pairs.sort_unstable();
    pairs.join("&")
}

fn derive_signing_key(secret_access_key: &str, date_stamp: &str, region: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_access_key).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn header_value(response: &reqwest::Response, name: &str) -> Result<String, Error> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::IntegrityFailure(format!("response missing {} header", name)))
}

async fn expect_status(response: reqwest::Response, status: u16) -> Result<reqwest::Response, Error> {
    expect_status_one_of(response, &[status]).await
}

async fn expect_status_one_of(
    response: reqwest::Response,
    statuses: &[u16],
) -> Result<reqwest::Response, Error> {
    let status = response.status().as_u16();
    if statuses.contains(&status) {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(Error::RemoteRejection { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_string_canonicalization_sorts_pairs() {
        assert_eq!(canonicalize_query("b=2&a=1"), "a=1&b=2");
        assert_eq!(canonicalize_query(""), "");
    }

    #[test]
    fn split_path_and_query_handles_bare_path() {
        let (path, query) = split_path_and_query("/x/y");
        assert_eq!(path, "/x/y");
        assert_eq!(query, "");
    }

    #[test]
    fn signing_key_derivation_is_deterministic() {
        let a = derive_signing_key("secret", "20150830", "us-east-1");
        let b = derive_signing_key("secret", "20150830", "us-east-1");
        assert_eq!(a, b);
        let c = derive_signing_key("other", "20150830", "us-east-1");
        assert_ne!(a, c);
    }
}
