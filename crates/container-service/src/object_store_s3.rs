//! S3-style object store adapter (C4): document blobs, raw text, and image
//! originals/thumbnails under `<container_id>/...` paths.
//!
//! Grounded in the teacher's `connector_s3.rs`: the same from-scratch AWS
//! SigV4 signer (`hmac`+`sha2`, no `aws-lc-sys`), the same minimal
//! string-based XML parsing for `ListObjectsV2` (no Nix-unfriendly XML
//! crate), and the same `endpoint_url` override for MinIO-style deployments.
//! The connector only ever listed and read; here the adapter also signs
//! `PUT` and `DELETE` requests, since ingestion writes blobs and container
//! deletion prunes a whole prefix (§3 Ownership: "deleting a container...
//! cascades through... object-store prefixes").

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use container_core::store::ObjectStore;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::ObjectConfig;

type HmacSha256 = Hmac<Sha256>;

pub struct S3ObjectStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
}

impl S3ObjectStore {
    pub fn new(config: &ObjectConfig) -> Result<Self> {
        let access_key_id = config
            .access_key_id
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
            .ok_or_else(|| anyhow!("object store access key not configured"))?;
        let secret_access_key = config
            .secret_access_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
            .ok_or_else(|| anyhow!("object store secret key not configured"))?;
        let client = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            access_key_id,
            secret_access_key,
        })
    }

    fn host(&self) -> String {
        self.endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string()
    }

    fn object_url(&self, path: &str) -> String {
        let encoded_key = path.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        format!("{}/{}/{}", self.endpoint, self.bucket, encoded_key)
    }

    /// Sign a request for `method`/`canonical_uri` (already URI-encoded,
    /// leading slash) with an empty body, per the teacher's SigV4 helpers.
    fn sign(&self, method: &str, canonical_uri: &str, query: &str) -> SignedHeaders {
        let host = self.host();
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(b"");

        let headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        let signed_headers: String = headers.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(";");
        let canonical_headers: String = headers.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();

        let canonical_request =
            format!("{method}\n{canonical_uri}\n{query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}");

        let credential_scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(&self.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key_id
        );

        SignedHeaders { authorization, amz_date, payload_hash }
    }
}

struct SignedHeaders {
    authorization: String,
    amz_date: String,
    payload_hash: String,
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let canonical_uri = format!("/{}/{}", self.bucket, path.split('/').map(uri_encode).collect::<Vec<_>>().join("/"));
        let signed = self.sign("PUT", &canonical_uri, "");
        let resp = self
            .client
            .put(self.object_url(path))
            .header("Authorization", &signed.authorization)
            .header("x-amz-date", &signed.amz_date)
            .header("x-amz-content-sha256", &signed.payload_hash)
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("object store put failed ({status}) for {path}: {body}");
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let canonical_uri = format!("/{}/{}", self.bucket, path.split('/').map(uri_encode).collect::<Vec<_>>().join("/"));
        let signed = self.sign("GET", &canonical_uri, "");
        let resp = self
            .client
            .get(self.object_url(path))
            .header("Authorization", &signed.authorization)
            .header("x-amz-date", &signed.amz_date)
            .header("x-amz-content-sha256", &signed.payload_hash)
            .send()
            .await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("object store get failed ({status}) for {path}: {body}");
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    /// Lists everything under `prefix` via `ListObjectsV2` scoped to the
    /// bucket, then issues one signed `DELETE` per key. Ingestion never
    /// calls this on the hot path; it is only used for container teardown
    /// (§3 Ownership), so per-key round-trips are an acceptable cost.
    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let keys = self.list_keys_with_prefix(prefix).await?;
        for key in keys {
            let canonical_uri = format!("/{}/{}", self.bucket, key.split('/').map(uri_encode).collect::<Vec<_>>().join("/"));
            let signed = self.sign("DELETE", &canonical_uri, "");
            let resp = self
                .client
                .delete(self.object_url(&key))
                .header("Authorization", &signed.authorization)
                .header("x-amz-date", &signed.amz_date)
                .header("x-amz-content-sha256", &signed.payload_hash)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() && status.as_u16() != 404 {
                let body = resp.text().await.unwrap_or_default();
                bail!("object store delete failed ({status}) for {key}: {body}");
            }
        }
        Ok(())
    }
}

impl S3ObjectStore {
    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut query_params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(token) = &continuation_token {
                query_params.push(("continuation-token".to_string(), token.clone()));
            }
            query_params.sort_by(|a, b| a.0.cmp(&b.0));
            let canonical_querystring: String = query_params
                .iter()
                .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
                .collect::<Vec<_>>()
                .join("&");

            let canonical_uri = format!("/{}", self.bucket);
            let signed = self.sign("GET", &canonical_uri, &canonical_querystring);
            let url = format!("{}/{}?{}", self.endpoint, self.bucket, canonical_querystring);
            let resp = self
                .client
                .get(&url)
                .header("Authorization", &signed.authorization)
                .header("x-amz-date", &signed.amz_date)
                .header("x-amz-content-sha256", &signed.payload_hash)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                bail!("object store list failed ({status}): {body}");
            }
            let xml_body = resp.text().await?;
            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml_body);
            keys.extend(batch);
            if is_truncated {
                continuation_token = next_token;
            } else {
                break;
            }
        }
        Ok(keys)
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{byte:02X}")),
        }
    }
    result
}

fn parse_list_objects_response(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let mut keys = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated").map(|v| v == "true").unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else { break };
        let block = &remaining[block_start..block_start + end];
        if let Some(key) = extract_xml_value(block, "Key") {
            if !key.is_empty() {
                keys.push(key);
            }
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }
    (keys, is_truncated, next_token)
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

/// Object-store path layout (§6 Persisted state layout).
pub fn raw_text_path(container_id: uuid::Uuid, document_id: uuid::Uuid) -> String {
    format!("{container_id}/{document_id}.txt")
}

pub fn original_image_path(container_id: uuid::Uuid, document_id: uuid::Uuid, filename: &str) -> String {
    format!("{container_id}/{document_id}/original/{filename}")
}

pub fn thumbnail_path(container_id: uuid::Uuid, document_id: uuid::Uuid, stem: &str) -> String {
    format!("{container_id}/{document_id}/thumbs/{stem}_thumb.jpg")
}

pub fn container_prefix(container_id: uuid::Uuid) -> String {
    format!("{container_id}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_scoped_under_container_and_document() {
        let c = uuid::Uuid::nil();
        let d = uuid::Uuid::nil();
        assert_eq!(raw_text_path(c, d), format!("{c}/{d}.txt"));
        assert!(original_image_path(c, d, "x.png").ends_with("/original/x.png"));
        assert!(thumbnail_path(c, d, "x").ends_with("/thumbs/x_thumb.jpg"));
        assert_eq!(container_prefix(c), format!("{c}/"));
    }

    #[test]
    fn parse_list_objects_response_extracts_keys_and_truncation() {
        let xml = r#"<ListBucketResult><IsTruncated>true</IsTruncated><NextContinuationToken>tok</NextContinuationToken><Contents><Key>a/b.txt</Key></Contents><Contents><Key>a/c.txt</Key></Contents></ListBucketResult>"#;
        let (keys, truncated, token) = parse_list_objects_response(xml);
        assert_eq!(keys, vec!["a/b.txt".to_string(), "a/c.txt".to_string()]);
        assert!(truncated);
        assert_eq!(token, Some("tok".to_string()));
    }
}
