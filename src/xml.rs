use std::time::Duration;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::broker::{PresignedPart, PresignedUrl};
use crate::error::UploadError;

/// `<request><objectKeys><key digest="…">…</key>…</objectKeys></request>`
/// (spec §6, "batch regular").
pub fn build_fetch_regular_request(keys: &[(String, String)]) -> String {
    let mut out = String::from("<request><objectKeys>");
    for (key, digest) in keys {
        out.push_str("<key digest=\"");
        escape_into(&mut out, digest);
        out.push_str("\">");
        escape_into(&mut out, key);
        out.push_str("</key>");
    }
    out.push_str("</objectKeys></request>");
    out
}

/// `<request><multipart objectKey="…" uploadId="…?" ttl="…?"><digest>…</digest>…</multipart></request>`
/// (spec §6, "multipart").
pub fn build_fetch_multipart_request(
    object_key: &str,
    part_digests: &[String],
    upload_id: Option<&str>,
    ttl: Option<Duration>,
) -> String {
    let mut out = String::from("<request><multipart objectKey=\"");
    escape_into(&mut out, object_key);
    out.push('"');
    if let Some(id) = upload_id {
        out.push_str(" uploadId=\"");
        escape_into(&mut out, id);
        out.push('"');
    }
    if let Some(ttl) = ttl {
        out.push_str(" ttl=\"");
        out.push_str(&ttl.as_secs().to_string());
        out.push('"');
    }
    out.push('>');
    for digest in part_digests {
        out.push_str("<digest>");
        escape_into(&mut out, digest);
        out.push_str("</digest>");
    }
    out.push_str("</multipart></request>");
    out
}

fn escape_into(out: &mut String, s: &str) {
    out.push_str(&quick_xml::escape::escape(s));
}

pub fn is_interrupted_body(body: &str) -> bool {
    body.contains("upload interrupted") || body.contains("UploadInterrupted")
}

/// `<presignedUrlListResponse><presignedUrl objectKey="…" uploadId="…?"
/// multipart="…"><url partNumber="…">…</url>…</presignedUrl>…</presignedUrlListResponse>`
/// (spec §6).
pub fn parse_presigned_url_list_response(body: &str) -> Result<Vec<PresignedUrl>, UploadError> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut results = Vec::new();
    let mut current: Option<(String, Option<String>, bool, Vec<PresignedPart>)> = None;
    let mut pending_part_number: Option<u32> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| UploadError::BrokerShape(e.to_string()))?;
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"presignedUrl" => {
                    let (object_key, upload_id, is_multipart) = parse_presigned_url_attrs(&e)?;
                    current = Some((object_key, upload_id, is_multipart, Vec::new()));
                }
                b"url" => {
                    pending_part_number = Some(parse_part_number(&e)?);
                }
                _ => {}
            },
            Event::Empty(e) if e.name().as_ref() == b"presignedUrl" => {
                let (object_key, upload_id, is_multipart) = parse_presigned_url_attrs(&e)?;
                results.push(PresignedUrl {
                    object_key,
                    upload_id,
                    parts: Vec::new(),
                    is_multipart,
                });
            }
            Event::Text(t) => {
                if let Some(part_number) = pending_part_number.take() {
                    let text = t
                        .unescape()
                        .map_err(|e| UploadError::BrokerShape(e.to_string()))?
                        .into_owned();
                    if let Some((_, _, _, parts)) = current.as_mut() {
                        parts.push(PresignedPart {
                            part_number,
                            url: text,
                            expires_at: None,
                        });
                    }
                }
            }
            Event::End(e) if e.name().as_ref() == b"presignedUrl" => {
                if let Some((object_key, upload_id, is_multipart, parts)) = current.take() {
                    results.push(PresignedUrl {
                        object_key,
                        upload_id,
                        parts,
                        is_multipart,
                    });
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(results)
}

fn parse_presigned_url_attrs(
    e: &BytesStart,
) -> Result<(String, Option<String>, bool), UploadError> {
    let mut object_key = None;
    let mut upload_id = None;
    let mut is_multipart = false;
    for attr in e.attributes() {
        let attr = attr.map_err(|e| UploadError::BrokerShape(e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| UploadError::BrokerShape(e.to_string()))?
            .into_owned();
        match attr.key.as_ref() {
            b"objectKey" => object_key = Some(value),
            b"uploadId" => upload_id = Some(value),
            b"multipart" => is_multipart = value == "true",
            _ => {}
        }
    }
    let object_key = object_key
        .ok_or_else(|| UploadError::BrokerShape("presignedUrl missing objectKey".to_string()))?;
    Ok((object_key, upload_id, is_multipart))
}

fn parse_part_number(e: &BytesStart) -> Result<u32, UploadError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| UploadError::BrokerShape(e.to_string()))?;
        if attr.key.as_ref() == b"partNumber" {
            let value = attr
                .unescape_value()
                .map_err(|e| UploadError::BrokerShape(e.to_string()))?;
            return value
                .parse()
                .map_err(|_| UploadError::BrokerShape(format!("invalid partNumber: {value}")));
        }
    }
    Err(UploadError::BrokerShape(
        "url element missing partNumber".to_string(),
    ))
}

/// S3 XML error body: `<Error><Code>…</Code><Message>…</Message></Error>`
/// (spec §4.3).
pub fn parse_s3_error(body: &str) -> Option<(String, String)> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut code = None;
    let mut message = None;
    let mut in_code = false;
    let mut in_message = false;

    loop {
        let event = reader.read_event_into(&mut buf).ok()?;
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"Code" => in_code = true,
                b"Message" => in_message = true,
                _ => {}
            },
            Event::Text(t) => {
                let text = t.unescape().ok()?.into_owned();
                if in_code {
                    code = Some(text);
                } else if in_message {
                    message = Some(text);
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"Code" => in_code = false,
                b"Message" => in_message = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    code.map(|c| (c, message.unwrap_or_default()))
}

/// S3 error codes that retry under the Retrier (spec §4.3).
pub fn is_recoverable_s3_code(code: &str) -> bool {
    matches!(code, "RequestTimeout" | "SlowDown" | "InternalError")
}
