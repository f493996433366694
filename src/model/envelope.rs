//! Structural fingerprint of a message: envelope headers and top-level body shape.
//!
//! None of this is used for display. It exists so that two parses of the same
//! bytes can be recognized as the same message when no stable ID exists.

use chrono::{DateTime, Utc};

use super::address::EmailAddress;

/// Envelope fields taken from the message header.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub references: Vec<String>,
    pub from: Vec<EmailAddress>,
    pub sender: Vec<EmailAddress>,
    pub reply_to: Vec<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub return_path: Vec<EmailAddress>,
    /// Value of the `Date:` header.
    pub date_sent: Option<DateTime<Utc>>,
}

/// Top-level MIME type category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Text,
    Multipart,
    Message,
    Application,
    Image,
    Audio,
    Video,
    Model,
    Other,
}

impl MediaType {
    /// Classify a lowercase top-level type name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "text" => Self::Text,
            "multipart" => Self::Multipart,
            "message" => Self::Message,
            "application" => Self::Application,
            "image" => Self::Image,
            "audio" => Self::Audio,
            "video" => Self::Video,
            "model" => Self::Model,
            _ => Self::Other,
        }
    }
}

/// Content-Transfer-Encoding of the top-level body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferEncoding {
    #[default]
    SevenBit,
    EightBit,
    Binary,
    QuotedPrintable,
    Base64,
    UuEncoded,
    Other,
}

impl TransferEncoding {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "7bit" => Self::SevenBit,
            "8bit" => Self::EightBit,
            "binary" => Self::Binary,
            "quoted-printable" => Self::QuotedPrintable,
            "base64" => Self::Base64,
            "x-uuencode" | "uuencode" | "x-uue" => Self::UuEncoded,
            _ => Self::Other,
        }
    }
}

/// One `attribute=value` pair of a Content-Type header, in header order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Parameter {
    pub attribute: String,
    pub value: String,
}

/// Shape of the top-level body part.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BodyShape {
    pub media_type: MediaType,
    pub subtype: String,
    pub encoding: TransferEncoding,
    pub description: Option<String>,
    pub parameters: Vec<Parameter>,
}

impl Default for BodyShape {
    fn default() -> Self {
        Self {
            media_type: MediaType::Text,
            subtype: "plain".to_string(),
            encoding: TransferEncoding::SevenBit,
            description: None,
            parameters: Vec::new(),
        }
    }
}

impl BodyShape {
    /// `type/subtype` for display.
    pub fn mime_type(&self) -> String {
        let top = serde_json::to_value(self.media_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "other".to_string());
        format!("{top}/{}", self.subtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_names() {
        assert_eq!(MediaType::from_name("multipart"), MediaType::Multipart);
        assert_eq!(MediaType::from_name("x-custom"), MediaType::Other);
    }

    #[test]
    fn test_transfer_encoding_is_case_insensitive() {
        assert_eq!(
            TransferEncoding::from_name(" Quoted-Printable "),
            TransferEncoding::QuotedPrintable
        );
        assert_eq!(TransferEncoding::from_name("BASE64"), TransferEncoding::Base64);
    }

    #[test]
    fn test_mime_type_display() {
        let shape = BodyShape {
            media_type: MediaType::Multipart,
            subtype: "mixed".to_string(),
            ..BodyShape::default()
        };
        assert_eq!(shape.mime_type(), "multipart/mixed");
        assert_eq!(BodyShape::default().mime_type(), "text/plain");
    }
}
