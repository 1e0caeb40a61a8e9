//! A small XML element reader and writer for signaling payloads.
//!
//! The signaling messages are single elements with attributes, child
//! elements, and text, and that is all this parser understands. No
//! declarations, comments, CDATA, or namespace resolution; namespaces
//! appear only as literal `xmlns` attributes.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::value,
    sequence::delimited,
    IResult,
};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum XmlError {
    #[error("malformed XML near {0:?}")]
    Malformed(String),
    #[error("mismatched closing tag for <{0}>")]
    MismatchedClose(String),
    #[error("trailing content after the document element")]
    TrailingContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self.attributes.iter_mut().find(|(key, _)| *key == name) {
            entry.1 = value;
        } else {
            self.attributes.push((name, value));
        }
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Text content of the named child, trimmed.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|child| child.text.trim())
    }

    pub fn add_child(&mut self, child: Element) {
        self.children.push(child);
    }

    pub fn add_text_child(&mut self, name: impl Into<String>, text: impl Into<String>) {
        let mut child = Element::new(name);
        child.text = text.into();
        self.children.push(child);
    }

    pub fn parse(input: &str) -> Result<Element, XmlError> {
        let (rest, element) =
            parse_element(input).map_err(|_| XmlError::Malformed(snippet(input)))?;
        if !rest.trim().is_empty() {
            return Err(XmlError::TrailingContent);
        }
        Ok(element)
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write(&mut out);
        out
    }

    fn write(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value));
            out.push('"');
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(&self.text));
        for child in &self.children {
            child.write(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

fn snippet(input: &str) -> String {
    input.chars().take(40).collect()
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn xml_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))(input)
}

fn attribute(input: &str) -> IResult<&str, (String, String)> {
    let (input, _) = multispace1(input)?;
    let (input, key) = xml_name(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char('=')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, raw) = delimited(char('"'), take_while(|c| c != '"'), char('"'))(input)?;
    Ok((input, (key.to_string(), unescape(raw))))
}

fn parse_element(input: &str) -> IResult<&str, Element> {
    let (input, _) = multispace0(input)?;
    let (input, _) = char('<')(input)?;
    let (mut input, name) = xml_name(input)?;
    let mut element = Element::new(name);

    while let Ok((rest, (key, value))) = attribute(input) {
        element.attributes.push((key, value));
        input = rest;
    }

    let (input, _) = multispace0(input)?;
    let (mut input, self_closing) = alt((value(true, tag("/>")), value(false, char('>'))))(input)?;
    if self_closing {
        return Ok((input, element));
    }

    loop {
        if let Some(rest) = input.strip_prefix("</") {
            let (rest, close_name) = xml_name(rest)?;
            let (rest, _) = multispace0(rest)?;
            let (rest, _) = char('>')(rest)?;
            if close_name != element.name {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Tag,
                )));
            }
            element.text = element.text.trim().to_string();
            return Ok((rest, element));
        }
        if input.starts_with('<') {
            let (rest, child) = parse_element(input)?;
            element.children.push(child);
            input = rest;
        } else {
            let end = input.find('<').ok_or_else(|| {
                nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::TakeUntil))
            })?;
            element.text.push_str(&unescape(&input[..end]));
            input = &input[end..];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_attributes_and_children() {
        let element = Element::parse(
            r#"<stunt xmlns="http://deusty.com/protocol/stunt" type="start_stunt" uuid="abc">
                 <ip4>10.0.0.2</ip4>
                 <predictedPort>40009</predictedPort>
               </stunt>"#,
        )
        .unwrap();
        assert_eq!(element.name, "stunt");
        assert_eq!(
            element.attribute("xmlns"),
            Some("http://deusty.com/protocol/stunt")
        );
        assert_eq!(element.attribute("type"), Some("start_stunt"));
        assert_eq!(element.child_text("ip4"), Some("10.0.0.2"));
        assert_eq!(element.child_text("predictedPort"), Some("40009"));
        assert!(element.child("serverPort").is_none());
    }

    #[test]
    fn self_closing_and_repeated_children() {
        let element = Element::parse(
            r#"<turn uuid="u1"><streamhost jid="a" host="h1" port="7777"/><streamhost jid="b" host="h2" port="7778"/></turn>"#,
        )
        .unwrap();
        let hosts: Vec<_> = element.children_named("streamhost").collect();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[1].attribute("jid"), Some("b"));
    }

    #[test]
    fn escaping_round_trips() {
        let mut element = Element::new("error");
        element.set_attribute("detail", r#"a "quoted" <value>"#);
        element.text = "1 & 2 < 3".into();
        let parsed = Element::parse(&element.to_xml()).unwrap();
        assert_eq!(parsed, element);
    }

    #[test]
    fn serializer_round_trips() {
        let mut element = Element::new("stun");
        element.set_attribute("uuid", "u-42");
        element.add_text_child("port", "40001");
        let mut range = Element::new("portRange");
        range.set_attribute("start", "39991");
        range.set_attribute("end", "40011");
        element.add_child(range);
        let parsed = Element::parse(&element.to_xml()).unwrap();
        assert_eq!(parsed, element);
    }

    #[test]
    fn rejects_mismatched_close() {
        assert!(Element::parse("<a><b></a></b>").is_err());
        assert!(Element::parse("<a>").is_err());
        assert_eq!(
            Element::parse("<a/><b/>").unwrap_err(),
            XmlError::TrailingContent
        );
    }
}
