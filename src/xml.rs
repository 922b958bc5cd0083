//! S3 XML response rendering.
//!
//! The only XML this service emits is the `ListBucketResult` Terraform's
//! S3 backend asks for while probing workspaces.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Fields echoed into a `ListBucketResult`.
#[derive(Debug, Clone, Default)]
pub struct ListBucketResult<'a> {
    pub name: &'a str,
    pub prefix: &'a str,
    pub max_keys: u32,
    pub key_count: u32,
    pub is_truncated: bool,
}

/// Render `<ListBucketResult>` for ListObjectsV2.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
///   <Name>tfstate</Name>
///   <Prefix>env:/</Prefix>
///   <KeyCount>0</KeyCount>
///   <MaxKeys>1000</MaxKeys>
///   <IsTruncated>false</IsTruncated>
/// </ListBucketResult>
/// ```
pub fn render_list_bucket_result(result: &ListBucketResult<'_>) -> Result<String, quick_xml::Error> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let root = BytesStart::new("ListBucketResult").with_attributes([("xmlns", S3_NAMESPACE)]);
    writer.write_event(Event::Start(root))?;
    write_text_element(&mut writer, "Name", result.name)?;
    write_text_element(&mut writer, "Prefix", result.prefix)?;
    write_text_element(&mut writer, "KeyCount", &result.key_count.to_string())?;
    write_text_element(&mut writer, "MaxKeys", &result.max_keys.to_string())?;
    write_text_element(
        &mut writer,
        "IsTruncated",
        if result.is_truncated { "true" } else { "false" },
    )?;
    writer.write_event(Event::End(BytesEnd::new("ListBucketResult")))?;

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| quick_xml::Error::NonDecodable(Some(e.utf8_error())))
}

/// Write a `<tag>text</tag>` element.
fn write_text_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    tag: &str,
    text: &str,
) -> Result<(), quick_xml::Error> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_empty_listing() {
        let xml = render_list_bucket_result(&ListBucketResult {
            name: "tfstate",
            prefix: "env:/",
            max_keys: 1000,
            key_count: 0,
            is_truncated: false,
        })
        .unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(
            "<ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">"
        ));
        assert!(xml.contains("<Name>tfstate</Name>"));
        assert!(xml.contains("<Prefix>env:/</Prefix>"));
        assert!(xml.contains("<KeyCount>0</KeyCount>"));
        assert!(xml.contains("<MaxKeys>1000</MaxKeys>"));
        assert!(xml.contains("<IsTruncated>false</IsTruncated>"));
    }

    #[test]
    fn test_prefix_is_escaped() {
        let xml = render_list_bucket_result(&ListBucketResult {
            name: "b",
            prefix: "a<b&c",
            ..Default::default()
        })
        .unwrap();
        assert!(xml.contains("<Prefix>a&lt;b&amp;c</Prefix>"));
    }
}
