//! Incremental interpretation of the INDI XML stream.
//!
//! The server sends an unbounded sequence of top-level elements. The reader
//! task feeds quick-xml events into [`StreamParser`], which yields complete
//! vectors, deletions, messages and decoded BLOBs.

use crate::client::IndiBlob;
use crate::{IndiElement, IndiPermission, IndiPropertyState, IndiPropertyType, IndiVector};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use quick_xml::events::BytesStart;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VectorAction {
    Define,
    Set,
}

#[derive(Debug)]
pub(crate) enum Parsed {
    Defined(IndiVector),
    Updated(IndiVector),
    Deleted { device: String, name: Option<String> },
    Message { device: String, message: String },
    Blob(IndiBlob),
}

struct PendingElement {
    name: String,
    label: String,
    format: Option<String>,
    text: String,
}

#[derive(Default)]
pub(crate) struct StreamParser {
    vector: Option<(VectorAction, IndiVector)>,
    element: Option<PendingElement>,
}

impl StreamParser {
    /// Start tag (or the opening half of an empty tag)
    pub(crate) fn start(&mut self, e: &BytesStart) -> Vec<Parsed> {
        let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
        let mut out = Vec::new();

        if let Some(kind) = vector_kind(&tag) {
            let action = if tag.starts_with("def") {
                VectorAction::Define
            } else {
                VectorAction::Set
            };
            let device = get_attribute(e, "device").unwrap_or_default();
            let name = get_attribute(e, "name").unwrap_or_default();
            if let Some(message) = get_attribute(e, "message") {
                out.push(Parsed::Message {
                    device: device.clone(),
                    message,
                });
            }
            self.vector = Some((
                action,
                IndiVector {
                    label: get_attribute(e, "label").unwrap_or_else(|| name.clone()),
                    group: get_attribute(e, "group").unwrap_or_default(),
                    kind,
                    state: IndiPropertyState::parse(
                        &get_attribute(e, "state").unwrap_or_else(|| "Idle".to_string()),
                    ),
                    perm: IndiPermission::parse(
                        &get_attribute(e, "perm").unwrap_or_else(|| "rw".to_string()),
                    ),
                    elements: Vec::new(),
                    device,
                    name,
                },
            ));
        } else if tag == "delProperty" {
            out.push(Parsed::Deleted {
                device: get_attribute(e, "device").unwrap_or_default(),
                name: get_attribute(e, "name").filter(|n| !n.is_empty()),
            });
        } else if tag == "message" {
            if let Some(message) = get_attribute(e, "message") {
                out.push(Parsed::Message {
                    device: get_attribute(e, "device").unwrap_or_default(),
                    message,
                });
            }
        } else if self.vector.is_some() && (tag.starts_with("def") || tag.starts_with("one")) {
            let name = get_attribute(e, "name").unwrap_or_default();
            self.element = Some(PendingElement {
                label: get_attribute(e, "label").unwrap_or_else(|| name.clone()),
                format: if tag.ends_with("BLOB") {
                    Some(get_attribute(e, "format").unwrap_or_else(|| ".fits".to_string()))
                } else {
                    None
                },
                text: String::new(),
                name,
            });
        }
        out
    }

    pub(crate) fn text(&mut self, text: &str) {
        if let Some(element) = self.element.as_mut() {
            element.text.push_str(text);
        }
    }

    /// End tag (or the closing half of an empty tag)
    pub(crate) fn end(&mut self, tag: &[u8]) -> Vec<Parsed> {
        let tag = String::from_utf8_lossy(tag);
        let mut out = Vec::new();

        if vector_kind(&tag).is_some() {
            if let Some((action, vector)) = self.vector.take() {
                out.push(match action {
                    VectorAction::Define => Parsed::Defined(vector),
                    VectorAction::Set => Parsed::Updated(vector),
                });
            }
            self.element = None;
            return out;
        }

        let (Some(element), Some((action, vector))) = (self.element.take(), self.vector.as_mut())
        else {
            return out;
        };

        match (&element.format, action) {
            (Some(format), VectorAction::Set) => {
                let payload: String = element.text.split_whitespace().collect();
                match BASE64.decode(payload.as_bytes()) {
                    Ok(data) => out.push(Parsed::Blob(IndiBlob {
                        device: vector.device.clone(),
                        property: vector.name.clone(),
                        element: element.name.clone(),
                        format: format.clone(),
                        data,
                    })),
                    Err(e) => tracing::warn!(
                        "Failed to decode BLOB base64 for {}.{}.{}: {}",
                        vector.device,
                        vector.name,
                        element.name,
                        e
                    ),
                }
                vector.elements.push(IndiElement {
                    name: element.name,
                    label: element.label,
                    value: String::new(),
                });
            }
            _ => vector.elements.push(IndiElement {
                name: element.name,
                label: element.label,
                value: element.text.trim().to_string(),
            }),
        }
        out
    }
}

/// `defXVector`, `setXVector`, `newXVector` -> property type of X
fn vector_kind(tag: &str) -> Option<IndiPropertyType> {
    let rest = tag
        .strip_prefix("def")
        .or_else(|| tag.strip_prefix("set"))
        .or_else(|| tag.strip_prefix("new"))?;
    IndiPropertyType::from_tag(rest.strip_suffix("Vector")?)
}

/// Helper to get an attribute from an XML start tag
fn get_attribute(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .map(|a| {
            a.unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).to_string())
        })
}

#[cfg(test)]
pub(crate) fn parse_all(xml: &str) -> Vec<Parsed> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(xml);
    reader.trim_text(true);
    let mut parser = StreamParser::default();
    let mut out = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => out.extend(parser.start(&e)),
            Ok(Event::Empty(e)) => {
                out.extend(parser.start(&e));
                out.extend(parser.end(e.name().as_ref()));
            }
            Ok(Event::Text(t)) => parser.text(&t.unescape().unwrap_or_default()),
            Ok(Event::End(e)) => out.extend(parser.end(e.name().as_ref())),
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    out
}
