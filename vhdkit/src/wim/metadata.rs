//! Embedded archive metadata document.
//!
//! Containers and images both expose an XML document through the archive
//! backend. It is parsed once into an owned element tree and queried with
//! absolute paths such as `/IMAGE/WINDOWS/ARCH`.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use vhdkit_shared::errors::{VhdkitError, VhdkitResult};

use crate::native::{ArchiveBackend, RawHandle};

/// One element of a parsed metadata document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Concatenated text content directly under this element.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    /// First child named `name`.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn from_start(start: &BytesStart<'_>) -> VhdkitResult<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| {
                VhdkitError::ParseFailure(format!("bad attribute on <{name}>: {e}"))
            })?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| VhdkitError::ParseFailure(format!("bad attribute value: {e}")))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            text: String::new(),
            children: Vec::new(),
        })
    }
}

/// Parsed metadata document of a container or image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataDocument {
    root: Element,
}

impl MetadataDocument {
    /// Parse an XML document with exactly one root element.
    pub fn parse(xml: &str) -> VhdkitResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader.read_event().map_err(|e| {
                VhdkitError::ParseFailure(format!(
                    "malformed metadata at byte {}: {e}",
                    reader.buffer_position()
                ))
            })?;

            match event {
                Event::Start(start) => {
                    if root.is_some() && stack.is_empty() {
                        return Err(multiple_roots());
                    }
                    stack.push(Element::from_start(&start)?);
                }
                Event::Empty(start) => {
                    let element = Element::from_start(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        VhdkitError::ParseFailure("unexpected closing tag".to_string())
                    })?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| VhdkitError::ParseFailure(format!("bad text: {e}")))?;
                    push_text(&mut stack, &text)?;
                }
                Event::CData(data) => {
                    let data = String::from_utf8_lossy(&data).into_owned();
                    push_text(&mut stack, &data)?;
                }
                Event::Eof => break,
                // Declarations, comments, processing instructions, doctype
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(VhdkitError::ParseFailure(format!(
                "unclosed element <{}>",
                open.name
            )));
        }

        root.map(|root| Self { root })
            .ok_or_else(|| VhdkitError::ParseFailure("metadata document is empty".to_string()))
    }

    /// Decode the backend representation: UTF-16LE whose first code unit is
    /// a marker, not content.
    pub fn from_backend_bytes(bytes: &[u8]) -> VhdkitResult<Self> {
        if bytes.len() % 2 != 0 {
            return Err(VhdkitError::ParseFailure(format!(
                "metadata length {} is not a whole number of UTF-16 units",
                bytes.len()
            )));
        }

        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .skip(1)
            .collect();
        let xml = String::from_utf16(&units)
            .map_err(|e| VhdkitError::ParseFailure(format!("metadata is not valid UTF-16: {e}")))?;

        Self::parse(xml.trim_end_matches('\0').trim())
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    /// Element at an absolute path. The first segment must name the root.
    pub fn element(&self, path: &str) -> Option<&Element> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        if segments.next()? != self.root.name {
            return None;
        }
        segments.try_fold(&self.root, |element, segment| element.child(segment))
    }

    pub fn text(&self, path: &str) -> Option<&str> {
        self.element(path).map(Element::text)
    }

    pub fn attribute(&self, path: &str, name: &str) -> Option<&str> {
        self.element(path)?.attribute(name)
    }
}

fn attach(
    stack: &mut Vec<Element>,
    root: &mut Option<Element>,
    element: Element,
) -> VhdkitResult<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_some() => return Err(multiple_roots()),
        None => *root = Some(element),
    }
    Ok(())
}

fn push_text(stack: &mut [Element], text: &str) -> VhdkitResult<()> {
    let current = stack.last_mut().ok_or_else(|| {
        VhdkitError::ParseFailure("text outside of the root element".to_string())
    })?;
    current.text.push_str(text);
    Ok(())
}

fn multiple_roots() -> VhdkitError {
    VhdkitError::ParseFailure("metadata has more than one root element".to_string())
}

/// Fetch and parse the metadata document for a container or image handle.
///
/// `Ok(None)` when the backend has no document for the handle.
pub(crate) fn fetch_document(
    backend: &dyn ArchiveBackend,
    handle: RawHandle,
) -> VhdkitResult<Option<MetadataDocument>> {
    let bytes = backend
        .image_information(handle)
        .map_err(|code| VhdkitError::backend("WIMGetImageInformation", code))?;

    match bytes {
        Some(bytes) => {
            let document = MetadataDocument::from_backend_bytes(&bytes)?;
            tracing::debug!(handle = %handle, root = document.root.name(), "Parsed metadata document");
            Ok(Some(document))
        }
        None => {
            tracing::debug!(handle = %handle, "Backend has no metadata document");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE: &str = r#"<IMAGE INDEX="2">
        <NAME>Windows Server Datacenter</NAME>
        <WINDOWS>
            <ARCH>9</ARCH>
            <VERSION><MAJOR>10</MAJOR><BUILD>20348</BUILD></VERSION>
        </WINDOWS>
        <DESCRIPTION>Fish &amp; chips</DESCRIPTION>
        <EMPTY/>
    </IMAGE>"#;

    fn encode(xml: &str) -> Vec<u8> {
        std::iter::once(0xFEFF_u16)
            .chain(xml.encode_utf16())
            .flat_map(u16::to_le_bytes)
            .collect()
    }

    #[test]
    fn test_path_lookup() {
        let doc = MetadataDocument::parse(IMAGE).unwrap();
        assert_eq!(doc.text("/IMAGE/NAME"), Some("Windows Server Datacenter"));
        assert_eq!(doc.text("/IMAGE/WINDOWS/VERSION/BUILD"), Some("20348"));
        assert_eq!(doc.text("/IMAGE/WINDOWS/VERSION/MINOR"), None);
        assert_eq!(doc.attribute("/IMAGE", "INDEX"), Some("2"));
        assert_eq!(doc.text("/IMAGE/EMPTY"), Some(""));
    }

    #[test]
    fn test_wrong_root_finds_nothing() {
        let doc = MetadataDocument::parse(IMAGE).unwrap();
        assert!(doc.element("/WIM/NAME").is_none());
    }

    #[test]
    fn test_entities_are_unescaped() {
        let doc = MetadataDocument::parse(IMAGE).unwrap();
        assert_eq!(doc.text("/IMAGE/DESCRIPTION"), Some("Fish & chips"));
    }

    #[test]
    fn test_backend_bytes_strip_marker() {
        let doc = MetadataDocument::from_backend_bytes(&encode("<WIM><TOTALBYTES>42</TOTALBYTES></WIM>"))
            .unwrap();
        assert_eq!(doc.root().name(), "WIM");
        assert_eq!(doc.text("/WIM/TOTALBYTES"), Some("42"));
    }

    #[test]
    fn test_odd_length_is_rejected() {
        let mut bytes = encode("<WIM/>");
        bytes.push(0);
        assert!(matches!(
            MetadataDocument::from_backend_bytes(&bytes),
            Err(VhdkitError::ParseFailure(_))
        ));
    }

    #[test]
    fn test_malformed_documents() {
        for xml in ["", "<IMAGE>", "<A/><B/>", "<A></B>", "just text"] {
            assert!(
                matches!(MetadataDocument::parse(xml), Err(VhdkitError::ParseFailure(_))),
                "expected parse failure for {xml:?}"
            );
        }
    }
}
