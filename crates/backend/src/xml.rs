//! XML payloads of the S3 wire protocol.
//!
//! Responses are parsed with quick-xml; request bodies are small enough to
//! build as literal strings with explicit escaping.

use crate::error::{BackendError, BackendResult};
use crate::types::PartChecksum;
use serde::Deserialize;

pub const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// `<Error><Code>…</Code><Message>…</Message></Error>`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProviderError {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// `<InitiateMultipartUploadResult>`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitiateMultipartUploadResult {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// `<CompleteMultipartUploadResult>`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompleteMultipartUploadResult {
    pub location: String,
    pub bucket: String,
    pub key: String,
    #[serde(rename = "ETag", default)]
    pub etag: String,
    #[serde(rename = "ChecksumSHA256", default)]
    pub checksum_sha256: String,
}

pub fn parse_provider_error(body: &str) -> BackendResult<ProviderError> {
    quick_xml::de::from_str(body)
        .map_err(|e| BackendError::BadResponse(format!("error document: {e}")))
}

pub fn parse_initiate_result(body: &str) -> BackendResult<InitiateMultipartUploadResult> {
    quick_xml::de::from_str(body)
        .map_err(|e| BackendError::BadResponse(format!("InitiateMultipartUploadResult: {e}")))
}

pub fn parse_complete_result(body: &str) -> BackendResult<CompleteMultipartUploadResult> {
    quick_xml::de::from_str(body)
        .map_err(|e| BackendError::BadResponse(format!("CompleteMultipartUploadResult: {e}")))
}

/// CreateBucket request body. Empty for `us-east-1`, which rejects an
/// explicit location constraint.
pub fn create_bucket_body(region: &str) -> String {
    if region == "us-east-1" {
        return String::new();
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <CreateBucketConfiguration xmlns=\"{S3_XMLNS}\">\n\
         \x20\x20<LocationConstraint>{}</LocationConstraint>\n\
         </CreateBucketConfiguration>",
        escape_xml(region)
    )
}

/// CompleteMultipartUpload request body: one `<Part>` per completed block,
/// sorted ascending by part number.
pub fn complete_multipart_body(parts: &[PartChecksum]) -> String {
    let mut sorted: Vec<&PartChecksum> = parts.iter().collect();
    sorted.sort_by_key(|p| p.part_number);

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(&format!("<CompleteMultipartUpload xmlns=\"{S3_XMLNS}\">\n"));
    for part in sorted {
        xml.push_str(&format!(
            "  <Part>\n    <PartNumber>{}</PartNumber>\n    <ETag>{}</ETag>\n    <ChecksumSHA256>{}</ChecksumSHA256>\n  </Part>\n",
            part.part_number,
            escape_xml(&part.etag),
            escape_xml(&part.checksum_sha256),
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_error_document() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>RequestTimeTooSkewed</Code><Message>The difference between the request time and the current time is too large.</Message></Error>"#;
        let err = parse_provider_error(body).unwrap();
        assert_eq!(err.code, "RequestTimeTooSkewed");
        assert!(err.message.contains("too large"));
    }

    #[test]
    fn success_document_is_not_an_error() {
        let body = r#"<InitiateMultipartUploadResult><Bucket>b</Bucket><Key>k</Key><UploadId>u</UploadId></InitiateMultipartUploadResult>"#;
        assert!(parse_provider_error(body).is_err());
    }

    #[test]
    fn parses_initiate_result() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>example-bucket</Bucket>
  <Key>7-6162-1714564800000</Key>
  <UploadId>VXBsb2FkIElE</UploadId>
</InitiateMultipartUploadResult>"#;
        let res = parse_initiate_result(body).unwrap();
        assert_eq!(res.bucket, "example-bucket");
        assert_eq!(res.key, "7-6162-1714564800000");
        assert_eq!(res.upload_id, "VXBsb2FkIElE");
    }

    #[test]
    fn parses_complete_result() {
        let body = r#"<CompleteMultipartUploadResult>
  <Location>https://example-bucket.s3.us-east-1.amazonaws.com/key</Location>
  <Bucket>example-bucket</Bucket>
  <Key>key</Key>
  <ETag>"3858f62230ac3c915f300c664312c11f-2"</ETag>
  <ChecksumSHA256>cGFydC1jaGVja3N1bQ==-2</ChecksumSHA256>
</CompleteMultipartUploadResult>"#;
        let res = parse_complete_result(body).unwrap();
        assert_eq!(
            res.location,
            "https://example-bucket.s3.us-east-1.amazonaws.com/key"
        );
        assert_eq!(res.checksum_sha256, "cGFydC1jaGVja3N1bQ==-2");
    }

    #[test]
    fn create_bucket_body_is_empty_for_us_east_1() {
        assert!(create_bucket_body("us-east-1").is_empty());
        let body = create_bucket_body("eu-west-2");
        assert!(body.contains("<LocationConstraint>eu-west-2</LocationConstraint>"));
        assert!(body.contains(S3_XMLNS));
    }

    #[test]
    fn complete_body_sorts_parts_ascending() {
        let parts = vec![
            PartChecksum {
                part_number: 3,
                etag: "\"e3\"".to_string(),
                checksum_sha256: "czM=".to_string(),
            },
            PartChecksum {
                part_number: 1,
                etag: "\"e1\"".to_string(),
                checksum_sha256: "czE=".to_string(),
            },
            PartChecksum {
                part_number: 2,
                etag: "\"e2\"".to_string(),
                checksum_sha256: "czI=".to_string(),
            },
        ];
        let body = complete_multipart_body(&parts);
        let p1 = body.find("<PartNumber>1</PartNumber>").unwrap();
        let p2 = body.find("<PartNumber>2</PartNumber>").unwrap();
        let p3 = body.find("<PartNumber>3</PartNumber>").unwrap();
        assert!(p1 < p2 && p2 < p3);
        assert!(body.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
    }

    #[test]
    fn xml_special_characters_are_escaped() {
        let parts = vec![PartChecksum {
            part_number: 1,
            etag: "\"<tag>&co\"".to_string(),
            checksum_sha256: "aGFzaA==".to_string(),
        }];
        let body = complete_multipart_body(&parts);
        assert!(body.contains("&quot;&lt;tag&gt;&amp;co&quot;"));
    }
}
