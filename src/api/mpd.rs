use anyhow::{anyhow, Context, Error};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::api::models::DashStream;

/// Parses the subset of MPEG-DASH's MPD schema this pipeline needs: a single
/// `AdaptationSet`/`Representation` carrying one `SegmentTemplate` whose
/// `media` attribute is a `$Number$`-templated URL, and a `SegmentTimeline`
/// whose `<S d=".." r="..">` entries are summed to find the segment count.
pub fn parse_stream_info(xml: &str) -> Result<DashStream, Error> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut mime_type = None;
    let mut codec = None;
    let mut url_template = None;
    let mut segment_count: u32 = 0;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).context("reading MPD xml")? {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) => {
                let name = e.name();
                let local = String::from_utf8_lossy(name.as_ref()).to_string();
                match local.as_str() {
                    "Representation" => {
                        for attr in e.attributes().flatten() {
                            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                            let value = attr.unescape_value()?.to_string();
                            match key.as_str() {
                                "mimeType" => mime_type = Some(value),
                                "codecs" => codec = Some(value),
                                _ => {}
                            }
                        }
                    }
                    "SegmentTemplate" => {
                        for attr in e.attributes().flatten() {
                            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                            if key == "media" {
                                url_template = Some(attr.unescape_value()?.to_string());
                            }
                        }
                    }
                    "S" => {
                        let mut repeat: u32 = 0;
                        for attr in e.attributes().flatten() {
                            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                            if key == "r" {
                                let value = attr.unescape_value()?.to_string();
                                repeat = value.parse().unwrap_or(0);
                            }
                        }
                        segment_count += 1 + repeat;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        buf.clear();
    }

    let url_template = url_template
        .ok_or_else(|| anyhow!("MPD manifest had no SegmentTemplate media attribute"))?;
    if !url_template.contains("$Number$") {
        return Err(anyhow!(
            "SegmentTemplate media attribute did not contain a $Number$ placeholder"
        ));
    }
    if segment_count == 0 {
        return Err(anyhow!("MPD manifest had no SegmentTimeline entries"));
    }

    Ok(DashStream {
        mime_type: mime_type.unwrap_or_default(),
        codec: codec.unwrap_or_default(),
        segment_count,
        url_template,
    })
}

/// Substitutes the literal `$Number$` token in a Dash segment URL template.
pub fn segment_url(template: &str, number: u32) -> String {
    template.replace("$Number$", &number.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<MPD>
  <Period>
    <AdaptationSet>
      <Representation mimeType="audio/mp4" codecs="flac">
        <SegmentTemplate media="https://example.com/seg-$Number$.m4s" startNumber="0">
          <SegmentTimeline>
            <S d="5000" r="3"/>
            <S d="5000" r="1"/>
          </SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn parses_segment_count_and_template() {
        let info = parse_stream_info(SAMPLE).unwrap();
        assert_eq!(info.mime_type, "audio/mp4");
        assert_eq!(info.codec, "flac");
        // first <S r="3"> is 4 segments, second <S r="1"> is 2 segments
        assert_eq!(info.segment_count, 6);
        assert_eq!(
            segment_url(&info.url_template, 3),
            "https://example.com/seg-3.m4s"
        );
    }

    #[test]
    fn rejects_manifest_without_placeholder() {
        let bad = SAMPLE.replace("$Number$", "fixed");
        assert!(parse_stream_info(&bad).is_err());
    }
}
