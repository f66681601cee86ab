//! File output resolution.
//!
//! Workers reference large or binary outputs as `file://` paths inside the
//! response file. Before the terminal snapshot is broadcast, each reference
//! is either uploaded to the request's `output_file_prefix` (PUT) or inlined
//! as a `data:` URI.

use std::path::Path;

use base64::Engine;

/// Resolve every `file://` reference in an output value. Arrays and objects
/// are walked recursively; unresolvable references are left in place.
pub async fn resolve_outputs(
    client: &reqwest::Client,
    output: serde_json::Value,
    upload_prefix: Option<&str>,
) -> serde_json::Value {
    match output {
        serde_json::Value::String(s) if s.starts_with("file://") => {
            resolve_file(client, &s, upload_prefix).await
        }
        serde_json::Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(Box::pin(resolve_outputs(client, item, upload_prefix)).await);
            }
            serde_json::Value::Array(resolved)
        }
        serde_json::Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(k, Box::pin(resolve_outputs(client, v, upload_prefix)).await);
            }
            serde_json::Value::Object(resolved)
        }
        other => other,
    }
}

async fn resolve_file(
    client: &reqwest::Client,
    reference: &str,
    upload_prefix: Option<&str>,
) -> serde_json::Value {
    let path = reference.trim_start_matches("file://");
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(path, error = %e, "Failed to read output file");
            return serde_json::Value::String(reference.to_string());
        }
    };

    let mime = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();

    if let Some(prefix) = upload_prefix {
        let filename = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        let url = if prefix.ends_with('/') {
            format!("{prefix}{filename}")
        } else {
            format!("{prefix}/{filename}")
        };

        match client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, &mime)
            .body(bytes)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                return serde_json::Value::String(url);
            }
            Ok(response) => {
                tracing::error!(
                    url,
                    status = response.status().as_u16(),
                    "Output upload rejected, falling back to data URI"
                );
            }
            Err(e) => {
                tracing::error!(url, error = %e, "Output upload failed, falling back to data URI");
            }
        }

        // Re-read: the upload consumed the body
        match tokio::fs::read(path).await {
            Ok(bytes) => return encode_data_uri(&mime, &bytes),
            Err(e) => {
                tracing::error!(path, error = %e, "Failed to re-read output file");
                return serde_json::Value::String(reference.to_string());
            }
        }
    }

    encode_data_uri(&mime, &bytes)
}

fn encode_data_uri(mime: &str, bytes: &[u8]) -> serde_json::Value {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    serde_json::Value::String(format!("data:{mime};base64,{encoded}"))
}
