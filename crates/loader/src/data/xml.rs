//! Record-style XML data files.
//!
//! ```xml
//! <strata>
//!     <data noupdate="1">
//!         <record id="main_company" model="res.company">
//!             <field name="name">My Company</field>
//!             <field name="parent_id" ref="other_company"/>
//!             <field name="active" eval="True"/>
//!         </record>
//!     </data>
//! </strata>
//! ```

use std::collections::BTreeMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use strata_core::XmlId;

use super::{DataRecord, DataValue, Origin, line_of};
use crate::error::LoadError;

const ROOTS: &[&str] = &["strata", "odoo", "openerp"];

struct PendingField {
    name: String,
    value: Option<DataValue>,
    text: String,
}

struct Parser<'a> {
    module: &'a str,
    path: &'a str,
    records: Vec<DataRecord>,
    noupdate: Vec<bool>,
    record: Option<DataRecord>,
    field: Option<PendingField>,
    line: u64,
}

pub(super) fn parse(module: &str, path: &str, contents: &str) -> Result<Vec<DataRecord>, LoadError> {
    let mut reader = Reader::from_str(contents);
    reader.config_mut().trim_text(true);
    let mut parser = Parser {
        module,
        path,
        records: Vec::new(),
        noupdate: Vec::new(),
        record: None,
        field: None,
        line: 1,
    };
    loop {
        let event = reader.read_event();
        // Position just past the event, so multi-line tags report their last line.
        let offset = usize::try_from(reader.buffer_position()).unwrap_or(usize::MAX);
        parser.line = line_of(contents, offset);
        let event = event.map_err(|err| parser.error(format!("malformed XML: {err}")))?;
        match event {
            Event::Start(element) => parser.open(&element, false)?,
            Event::Empty(element) => parser.open(&element, true)?,
            Event::End(element) => {
                let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
                parser.close(&name)?;
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|err| parser.error(format!("malformed text: {err}")))?;
                parser.text(&text)?;
            }
            Event::CData(data) => parser.text(&String::from_utf8_lossy(&data))?,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(parser.records)
}

fn flag(raw: &str) -> bool {
    matches!(raw.trim(), "1" | "true" | "True")
}

impl Parser<'_> {
    fn error(&self, message: impl Into<String>) -> LoadError {
        LoadError::data_file(self.module, self.path, Some(self.line), message)
    }

    fn attributes(&self, element: &BytesStart) -> Result<BTreeMap<String, String>, LoadError> {
        let mut out = BTreeMap::new();
        for attr in element.attributes() {
            let attr = attr.map_err(|err| self.error(format!("malformed attribute: {err}")))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|err| self.error(format!("malformed attribute: {err}")))?
                .into_owned();
            out.insert(key, value);
        }
        Ok(out)
    }

    fn open(&mut self, element: &BytesStart, empty: bool) -> Result<(), LoadError> {
        let tag = String::from_utf8_lossy(element.name().as_ref()).into_owned();
        let mut attrs = self.attributes(element)?;
        if self.field.is_some() {
            return Err(self.error(format!("unexpected <{tag}> inside <field>")));
        }
        let inherited = self.noupdate.last().copied().unwrap_or(false);
        match tag.as_str() {
            root if ROOTS.contains(&root) || root == "data" => {
                let noupdate = attrs.get("noupdate").map(String::as_str).map(flag).unwrap_or(inherited);
                if !empty {
                    self.noupdate.push(noupdate);
                }
            }
            "record" => {
                if self.record.is_some() {
                    return Err(self.error("records cannot be nested"));
                }
                let model = attrs
                    .remove("model")
                    .ok_or_else(|| self.error("<record> needs a model attribute"))?;
                let xml_id = attrs
                    .remove("id")
                    .map(|id| XmlId::qualify(&id, self.module))
                    .transpose()
                    .map_err(|err| self.error(err.to_string()))?;
                let noupdate = attrs.get("noupdate").map(String::as_str).map(flag).unwrap_or(inherited);
                self.record = Some(DataRecord {
                    xml_id,
                    model,
                    values: Vec::new(),
                    noupdate,
                    origin: Origin {
                        file: self.path.to_string(),
                        line: Some(self.line),
                    },
                });
                if empty {
                    self.close("record")?;
                }
            }
            "field" => {
                if self.record.is_none() {
                    return Err(self.error("<field> outside of a <record>"));
                }
                let name = attrs
                    .remove("name")
                    .ok_or_else(|| self.error("<field> needs a name attribute"))?;
                let value = match (attrs.remove("ref"), attrs.remove("eval")) {
                    (Some(_), Some(_)) => {
                        return Err(self.error(format!("field '{name}' has both ref and eval")));
                    }
                    (Some(reference), None) => Some(DataValue::Ref(reference)),
                    (None, Some(expr)) => Some(DataValue::Eval(expr)),
                    (None, None) => None,
                };
                self.field = Some(PendingField {
                    name,
                    value,
                    text: String::new(),
                });
                if empty {
                    self.close("field")?;
                }
            }
            other => return Err(self.error(format!("unsupported element <{other}>"))),
        }
        Ok(())
    }

    fn close(&mut self, tag: &str) -> Result<(), LoadError> {
        match tag {
            "field" => {
                if let (Some(field), Some(record)) = (self.field.take(), self.record.as_mut()) {
                    let value = field.value.unwrap_or(DataValue::Text(field.text));
                    record.values.push((field.name, value));
                }
            }
            "record" => {
                if let Some(record) = self.record.take() {
                    self.records.push(record);
                }
            }
            _ => {
                self.noupdate.pop();
            }
        }
        Ok(())
    }

    fn text(&mut self, text: &str) -> Result<(), LoadError> {
        if let Some(field) = self.field.as_mut() {
            field.text.push_str(text);
            return Ok(());
        }
        if text.trim().is_empty() {
            Ok(())
        } else {
            Err(self.error(format!("unexpected text '{}'", text.trim())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<strata>
    <!-- comment -->
    <record id="a" model="item">
        <field name="name">A &amp; B</field>
        <field name="qty" eval="3"/>
    </record>
    <data noupdate="1">
        <record id="other.b" model="item">
            <field name="parent_id" ref="a"/>
            <field name="note"><![CDATA[<b>bold</b>]]></field>
        </record>
    </data>
</strata>
"#;

    #[test]
    fn records_carry_values_and_flags() {
        let records = parse("m", "data/items.xml", SAMPLE).unwrap();
        assert_eq!(records.len(), 2);

        let a = &records[0];
        assert_eq!(a.xml_id, Some(XmlId::new("m", "a")));
        assert!(!a.noupdate);
        assert_eq!(a.origin.line, Some(4));
        assert_eq!(
            a.values,
            vec![
                ("name".to_string(), DataValue::Text("A & B".into())),
                ("qty".to_string(), DataValue::Eval("3".into())),
            ]
        );

        let b = &records[1];
        assert_eq!(b.xml_id, Some(XmlId::new("other", "b")));
        assert!(b.noupdate);
        assert_eq!(b.values[0].1, DataValue::Ref("a".into()));
        assert_eq!(b.values[1].1, DataValue::Text("<b>bold</b>".into()));
    }

    #[test]
    fn records_need_a_model() {
        let err = parse("m", "d.xml", "<strata>\n<record id=\"x\"/>\n</strata>").unwrap_err();
        let LoadError::DataFile { position, message, .. } = err else {
            panic!("unexpected error");
        };
        assert_eq!(position, Some(2));
        assert!(message.contains("model"), "{message}");
    }

    #[test]
    fn unknown_elements_are_rejected() {
        assert!(parse("m", "d.xml", "<strata><menuitem id=\"x\"/></strata>").is_err());
        assert!(parse("m", "d.xml", "<strata><record model=\"x\"></strata>").is_err());
    }

    #[test]
    fn records_without_id_are_allowed() {
        let records = parse("m", "d.xml", "<odoo><record model=\"item\"/></odoo>").unwrap();
        assert_eq!(records[0].xml_id, None);
        assert!(records[0].values.is_empty());
    }
}
