//! 工作单元的序列化模式
//!
//! - Text: JSON
//! - Binary: bincode(默认)
//! - Xml: quick-xml，负载以JSON文本嵌入`<payload>`元素

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::{ProcessingStatus, Processable, TimingMarks, WorkItem};

/// 编解码错误
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("XML serialization error: {0}")]
    XmlSerialize(String),
    #[error("XML deserialization error: {0}")]
    XmlDeserialize(String),
    #[error("invalid field: {0}")]
    InvalidField(String),
}

/// 序列化模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationMode {
    Text,
    Xml,
    #[default]
    Binary,
}

impl SerializationMode {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            SerializationMode::Text => "text",
            SerializationMode::Xml => "xml",
            SerializationMode::Binary => "binary",
        }
    }

    pub fn from_str_name(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "xml" => Some(Self::Xml),
            "binary" => Some(Self::Binary),
            _ => None,
        }
    }

    pub fn encode_item<P: Processable>(&self, item: &WorkItem<P>) -> Result<Vec<u8>, CodecError> {
        match self {
            SerializationMode::Text => Ok(serde_json::to_vec(item)?),
            SerializationMode::Binary => Ok(bincode::serialize(item)?),
            SerializationMode::Xml => {
                let doc = XmlItem::from_item(item)?;
                quick_xml::se::to_string(&doc)
                    .map(String::into_bytes)
                    .map_err(|e| CodecError::XmlSerialize(e.to_string()))
            }
        }
    }

    pub fn decode_item<P: Processable>(&self, bytes: &[u8]) -> Result<WorkItem<P>, CodecError> {
        match self {
            SerializationMode::Text => Ok(serde_json::from_slice(bytes)?),
            SerializationMode::Binary => Ok(bincode::deserialize(bytes)?),
            SerializationMode::Xml => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| CodecError::XmlDeserialize(e.to_string()))?;
                let doc: XmlItem = quick_xml::de::from_str(text)
                    .map_err(|e| CodecError::XmlDeserialize(e.to_string()))?;
                doc.into_item()
            }
        }
    }
}

/// XML文档结构，所有非数值字段都以文本保存
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "work_item")]
struct XmlItem {
    id: String,
    generation: u64,
    position: usize,
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outbound_submitted: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outbound_retrieved: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inbound_submitted: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inbound_retrieved: Option<String>,
    payload: String,
}

impl XmlItem {
    fn from_item<P: Processable>(item: &WorkItem<P>) -> Result<Self, CodecError> {
        Ok(Self {
            id: item.id.to_string(),
            generation: item.generation,
            position: item.position,
            status: item.status.as_str_name().to_string(),
            error: item.error.clone().filter(|e| !e.is_empty()),
            port: item.port,
            outbound_submitted: item.marks.outbound_submitted.map(|t| t.to_rfc3339()),
            outbound_retrieved: item.marks.outbound_retrieved.map(|t| t.to_rfc3339()),
            inbound_submitted: item.marks.inbound_submitted.map(|t| t.to_rfc3339()),
            inbound_retrieved: item.marks.inbound_retrieved.map(|t| t.to_rfc3339()),
            payload: serde_json::to_string(&item.payload)?,
        })
    }

    fn into_item<P: Processable>(self) -> Result<WorkItem<P>, CodecError> {
        let id = self
            .id
            .parse()
            .map_err(|_| CodecError::InvalidField(format!("id {:?}", self.id)))?;
        let status = ProcessingStatus::from_str_name(&self.status)
            .ok_or_else(|| CodecError::InvalidField(format!("status {:?}", self.status)))?;
        let marks = TimingMarks {
            outbound_submitted: parse_time(self.outbound_submitted)?,
            outbound_retrieved: parse_time(self.outbound_retrieved)?,
            inbound_submitted: parse_time(self.inbound_submitted)?,
            inbound_retrieved: parse_time(self.inbound_retrieved)?,
        };
        Ok(WorkItem {
            id,
            generation: self.generation,
            position: self.position,
            status,
            error: self.error,
            port: self.port,
            marks,
            payload: serde_json::from_str(&self.payload)?,
        })
    }
}

fn parse_time(value: Option<String>) -> Result<Option<DateTime<Utc>>, CodecError> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| CodecError::InvalidField(format!("timestamp {:?}", s)))
        })
        .transpose()
}
