//! Platform XML messages: inbound decoding and reply building.
//!
//! Inbound messages are flat: one `<xml>` root whose children carry text or
//! CDATA. Nested structures (article lists, picture info) are kept only as
//! their leaf values under the leaf's element name.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("empty message body")]
    Empty,
    #[error("malformed XML: {0}")]
    Xml(String),
}

/// A decoded inbound message or event, keyed by element name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DecodedMessage {
    fields: BTreeMap<String, String>,
}

impl DecodedMessage {
    /// Parses a platform XML document.
    pub fn parse(xml: &str) -> Result<Self, MessageError> {
        if xml.trim().is_empty() {
            return Err(MessageError::Empty);
        }

        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut fields = BTreeMap::new();
        let mut path: Vec<String> = Vec::new();
        let mut text = String::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                    text.clear();
                }
                Ok(Event::Text(e)) => {
                    let unescaped = e.unescape().map_err(|e| MessageError::Xml(e.to_string()))?;
                    text.push_str(&unescaped);
                }
                Ok(Event::CData(e)) => {
                    text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
                Ok(Event::End(_)) => {
                    // Below the root only; the first value for a name wins
                    if let Some(name) = path.pop() {
                        if !path.is_empty() && !text.is_empty() {
                            fields.entry(name).or_insert_with(|| text.clone());
                        }
                    }
                    text.clear();
                }
                Ok(Event::Empty(e)) => {
                    if !path.is_empty() {
                        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                        fields.entry(name).or_insert_with(String::new);
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(MessageError::Xml(e.to_string())),
            }
        }

        if !path.is_empty() {
            return Err(MessageError::Xml("unclosed element".to_string()));
        }

        Ok(Self { fields })
    }

    /// Builds a message from an already-parsed body. Accepts the fields at
    /// the top level or under an `xml` key; scalar values are stringified.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = match value.get("xml") {
            Some(Value::Object(inner)) => inner,
            _ => value.as_object()?,
        };

        let fields: BTreeMap<String, String> = object
            .iter()
            .filter_map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((k.clone(), text))
            })
            .collect();

        if fields.is_empty() {
            None
        } else {
            Some(Self { fields })
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn msg_type(&self) -> Option<&str> {
        self.get("MsgType")
    }

    pub fn event(&self) -> Option<&str> {
        self.get("Event")
    }

    pub fn info_type(&self) -> Option<&str> {
        self.get("InfoType")
    }

    pub fn content(&self) -> Option<&str> {
        self.get("Content")
    }

    pub fn from_user(&self) -> Option<&str> {
        self.get("FromUserName")
    }

    pub fn to_user(&self) -> Option<&str> {
        self.get("ToUserName")
    }

    /// Encrypted payload of an envelope (`Encrypt`, or `encrypt` from
    /// pre-parsed bodies).
    pub fn encrypt(&self) -> Option<&str> {
        self.get("Encrypt")
            .or_else(|| self.get("encrypt"))
            .filter(|s| !s.is_empty())
    }

    /// Whether this looks like a real message rather than an envelope.
    pub fn is_message(&self) -> bool {
        self.msg_type().is_some() || self.to_user().is_some() || self.from_user().is_some()
    }
}

/// One item of a news reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "picUrl", alias = "pic_url")]
    pub pic_url: String,
    #[serde(default)]
    pub url: String,
}

/// Passive reply a message handler may return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReplyMessage {
    Text {
        content: String,
    },
    Image {
        #[serde(rename = "mediaId", alias = "media_id")]
        media_id: String,
    },
    News {
        #[serde(rename = "content", alias = "articles")]
        articles: Vec<Article>,
    },
}

impl ReplyMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Reply XML addressed back to the sender of `inbound`.
    pub fn to_xml(&self, inbound: &DecodedMessage, create_time: i64) -> String {
        let to_user = inbound.from_user().unwrap_or_default();
        let from_user = inbound.to_user().unwrap_or_default();

        let mut xml = String::from("<xml>\n");
        xml.push_str(&format!("<ToUserName>{}</ToUserName>\n", cdata(to_user)));
        xml.push_str(&format!("<FromUserName>{}</FromUserName>\n", cdata(from_user)));
        xml.push_str(&format!("<CreateTime>{}</CreateTime>\n", create_time));

        match self {
            Self::Text { content } => {
                xml.push_str("<MsgType><![CDATA[text]]></MsgType>\n");
                xml.push_str(&format!("<Content>{}</Content>\n", cdata(content)));
            }
            Self::Image { media_id } => {
                xml.push_str("<MsgType><![CDATA[image]]></MsgType>\n");
                xml.push_str(&format!(
                    "<Image><MediaId>{}</MediaId></Image>\n",
                    cdata(media_id)
                ));
            }
            Self::News { articles } => {
                xml.push_str("<MsgType><![CDATA[news]]></MsgType>\n");
                xml.push_str(&format!("<ArticleCount>{}</ArticleCount>\n", articles.len()));
                xml.push_str("<Articles>\n");
                for article in articles {
                    xml.push_str(&format!(
                        "<item>\n<Title>{}</Title>\n<Description>{}</Description>\n<PicUrl>{}</PicUrl>\n<Url>{}</Url>\n</item>\n",
                        cdata(&article.title),
                        cdata(&article.description),
                        cdata(&article.pic_url),
                        cdata(&article.url),
                    ));
                }
                xml.push_str("</Articles>\n");
            }
        }

        xml.push_str("</xml>");
        xml
    }
}

/// Outbound encrypted envelope.
pub fn envelope_xml(encrypt: &str, signature: &str, timestamp: &str, nonce: &str) -> String {
    format!(
        "<xml>\n<Encrypt>{}</Encrypt>\n<MsgSignature>{}</MsgSignature>\n<TimeStamp>{}</TimeStamp>\n<Nonce>{}</Nonce>\n</xml>",
        cdata(encrypt),
        cdata(signature),
        timestamp,
        cdata(nonce)
    )
}

/// Wraps `value` in a CDATA section, splitting any embedded terminator.
fn cdata(value: &str) -> String {
    format!("<![CDATA[{}]]>", value.replace("]]>", "]]]]><![CDATA[>"))
}
