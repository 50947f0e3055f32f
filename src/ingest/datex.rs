//! Normalizer for the NDW DATEX II bridge opening publication.
//!
//! A `situationRecord` is one candidate opening. Malformed records are
//! dropped and counted; only a document that is not well-formed XML (or is
//! not a DATEX publication at all) fails the batch.

use crate::models::{Coordinate, OpeningLink, OpeningRecord};
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::borrow::Cow;
use std::io::Read;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BRIDGE_OPENING_TYPE: &str = "bridgeSwingInOperation";

/// Result of normalizing one feed document
#[derive(Debug, Default)]
pub struct NormalizedFeed {
    pub records: Vec<OpeningRecord>,
    pub dropped: Vec<DroppedRecord>,
    /// Situation records that are not bridge openings
    pub ignored: usize,
}

impl NormalizedFeed {
    pub fn dropped_count(&self) -> usize {
        self.dropped.len()
    }

    /// Bridge opening records seen, accepted or not
    pub fn total(&self) -> usize {
        self.records.len() + self.dropped.len()
    }
}

#[derive(Debug)]
pub struct DroppedRecord {
    pub record_id: Option<String>,
    pub reason: RecordValidationError,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordValidationError {
    #[error("record has no usable location")]
    MissingLocation,
    #[error("record has no start time")]
    MissingStart,
    #[error("invalid {field} timestamp: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("end time precedes start time")]
    EndBeforeStart,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedFormatError {
    #[error("Failed to decompress feed: {0}")]
    Compression(String),
    #[error("Malformed XML at byte {position}: {message}")]
    Xml { position: u64, message: String },
    #[error("Document ended before all elements were closed")]
    Truncated,
    #[error("Document is not a DATEX II publication")]
    NotAPublication,
}

/// Decompress (if gzipped) and parse a feed payload
pub fn normalize(payload: &[u8]) -> Result<NormalizedFeed, FeedFormatError> {
    let xml = decompress(payload)?;
    parse_publication(&xml)
}

fn decompress(payload: &[u8]) -> Result<Cow<'_, [u8]>, FeedFormatError> {
    if !payload.starts_with(&GZIP_MAGIC) {
        return Ok(Cow::Borrowed(payload));
    }

    let mut xml = Vec::new();
    GzDecoder::new(payload)
        .read_to_end(&mut xml)
        .map_err(|e| FeedFormatError::Compression(e.to_string()))?;
    debug!(compressed = payload.len(), decompressed = xml.len(), "Decompressed feed");
    Ok(Cow::Owned(xml))
}

#[derive(Debug, Default)]
struct RecordDraft {
    id: Option<String>,
    version: Option<String>,
    management_type: Option<String>,
    start: Option<String>,
    end: Option<String>,
    latitude: Option<String>,
    longitude: Option<String>,
    source: Option<String>,
    operator_status: Option<String>,
    links: Vec<OpeningLink>,
}

fn parse_publication(xml: &[u8]) -> Result<NormalizedFeed, FeedFormatError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut feed = NormalizedFeed::default();
    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut draft: Option<RecordDraft> = None;
    let mut saw_publication = false;

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| FeedFormatError::Xml {
            position: reader.error_position() as u64,
            message: e.to_string(),
        })?;

        match event {
            Event::Start(e) => {
                let name = local_name(&e);
                open_element(&name, &e, &mut draft, &mut saw_publication);
                path.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(&e);
                open_element(&name, &e, &mut draft, &mut saw_publication);
                if name == "situationRecord" {
                    close_record(&mut draft, &mut feed);
                }
            }
            Event::End(_) => {
                if path.pop().as_deref() == Some("situationRecord") {
                    close_record(&mut draft, &mut feed);
                }
            }
            Event::Text(t) => {
                if let Some(record) = draft.as_mut() {
                    let text = t.unescape().map_err(|e| FeedFormatError::Xml {
                        position: reader.buffer_position() as u64,
                        message: e.to_string(),
                    })?;
                    assign_text(record, &path, text.trim());
                }
            }
            Event::CData(t) => {
                if let Some(record) = draft.as_mut() {
                    let text = String::from_utf8_lossy(&t);
                    assign_text(record, &path, text.trim());
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !path.is_empty() {
        return Err(FeedFormatError::Truncated);
    }
    if !saw_publication {
        return Err(FeedFormatError::NotAPublication);
    }

    debug!(
        accepted = feed.records.len(),
        dropped = feed.dropped.len(),
        ignored = feed.ignored,
        "Parsed opening feed"
    );
    Ok(feed)
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn open_element(
    name: &str,
    e: &BytesStart<'_>,
    draft: &mut Option<RecordDraft>,
    saw_publication: &mut bool,
) {
    match name {
        "payloadPublication" => *saw_publication = true,
        "situationRecord" => {
            let mut record = RecordDraft::default();
            for attr in e.attributes().flatten() {
                let value = attr.unescape_value().ok().map(|v| v.trim().to_string());
                match attr.key.local_name().as_ref() {
                    b"id" => record.id = value.filter(|v| !v.is_empty()),
                    b"version" => record.version = value.filter(|v| !v.is_empty()),
                    _ => {}
                }
            }
            *draft = Some(record);
        }
        "urlLink" => {
            if let Some(record) = draft.as_mut() {
                record.links.push(OpeningLink {
                    url: None,
                    description: None,
                });
            }
        }
        _ => {}
    }
}

fn assign_text(record: &mut RecordDraft, path: &[String], text: &str) {
    if text.is_empty() {
        return;
    }

    let Some(current) = path.last() else {
        return;
    };
    let within = |ancestor: &str| path.iter().any(|p| p == ancestor);

    // First occurrence wins: a record may list several locations
    let set_once = |slot: &mut Option<String>| {
        if slot.is_none() {
            *slot = Some(text.to_string());
        }
    };

    match current.as_str() {
        "overallStartTime" => set_once(&mut record.start),
        "overallEndTime" => set_once(&mut record.end),
        "latitude" if within("pointCoordinates") => set_once(&mut record.latitude),
        "longitude" if within("pointCoordinates") => set_once(&mut record.longitude),
        "generalNetworkManagementType" => set_once(&mut record.management_type),
        "operatorActionStatus" => set_once(&mut record.operator_status),
        "urlLinkAddress" => {
            if let Some(link) = record.links.last_mut() {
                set_once(&mut link.url);
            }
        }
        "value" if within("urlLinkDescription") => {
            if let Some(link) = record.links.last_mut() {
                set_once(&mut link.description);
            }
        }
        "value" if within("sourceName") => set_once(&mut record.source),
        _ => {}
    }
}

fn close_record(draft: &mut Option<RecordDraft>, feed: &mut NormalizedFeed) {
    let Some(record) = draft.take() else {
        return;
    };

    if record.management_type.as_deref() != Some(BRIDGE_OPENING_TYPE) {
        feed.ignored += 1;
        return;
    }

    let record_id = record.id.clone();
    match validate(record) {
        Ok(opening) => feed.records.push(opening),
        Err(reason) => {
            warn!(record_id = ?record_id, reason = %reason, "Dropping feed record");
            feed.dropped.push(DroppedRecord { record_id, reason });
        }
    }
}

fn validate(record: RecordDraft) -> Result<OpeningRecord, RecordValidationError> {
    let lat = record.latitude.as_deref().and_then(|v| v.parse::<f64>().ok());
    let lon = record.longitude.as_deref().and_then(|v| v.parse::<f64>().ok());
    let site = match (lat, lon) {
        (Some(lat), Some(lon)) => Coordinate::new(lat, lon),
        _ => return Err(RecordValidationError::MissingLocation),
    };
    if !site.is_valid() {
        return Err(RecordValidationError::MissingLocation);
    }

    let start_raw = record.start.ok_or(RecordValidationError::MissingStart)?;
    let start = parse_timestamp(&start_raw).ok_or(RecordValidationError::InvalidTimestamp {
        field: "start",
        value: start_raw.clone(),
    })?;

    let end = match record.end {
        Some(raw) => Some(parse_timestamp(&raw).ok_or(
            RecordValidationError::InvalidTimestamp {
                field: "end",
                value: raw.clone(),
            },
        )?),
        None => None,
    };

    if end.is_some_and(|end| end < start) {
        return Err(RecordValidationError::EndBeforeStart);
    }

    Ok(OpeningRecord {
        site,
        record_id: record.id,
        record_version: record.version,
        start,
        end,
        source: record.source,
        operator_status: record.operator_status,
        links: record
            .links
            .into_iter()
            .filter(|l| l.url.is_some() || l.description.is_some())
            .collect(),
    })
}

/// RFC 3339, or offset-less ISO 8601 taken as UTC. Truncated to whole seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.and_utc())
        })
        .ok()?;

    DateTime::from_timestamp(parsed.timestamp(), 0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    pub(crate) struct SampleRecord<'a> {
        pub id: &'a str,
        pub start: Option<&'a str>,
        pub end: Option<&'a str>,
        pub lat: Option<&'a str>,
        pub lon: Option<&'a str>,
        pub management_type: &'a str,
        pub link: Option<&'a str>,
    }

    impl<'a> SampleRecord<'a> {
        pub fn opening(id: &'a str, start: &'a str, end: &'a str) -> Self {
            Self {
                id,
                start: Some(start),
                end: Some(end),
                lat: Some("52.37004"),
                lon: Some("4.88996"),
                management_type: BRIDGE_OPENING_TYPE,
                link: None,
            }
        }

        fn to_xml(&self) -> String {
            let optional = |tag: &str, value: Option<&str>| {
                value
                    .map(|v| format!("<d2:{tag}>{v}</d2:{tag}>"))
                    .unwrap_or_default()
            };
            let link = self
                .link
                .map(|url| {
                    format!(
                        "<d2:urlLink><d2:urlLinkAddress>{url}</d2:urlLinkAddress>\
                         <d2:urlLinkDescription><d2:values><d2:value lang=\"nl\">Bediening</d2:value></d2:values></d2:urlLinkDescription></d2:urlLink>"
                    )
                })
                .unwrap_or_default();

            format!(
                r#"<d2:situationRecord xsi:type="NetworkManagement" id="{id}" version="2">
  <d2:situationRecordCreationTime>2024-05-01T08:00:00Z</d2:situationRecordCreationTime>
  <d2:situationRecordVersionTime>2024-05-01T08:00:00Z</d2:situationRecordVersionTime>
  <d2:source><d2:sourceName><d2:values><d2:value lang="nl">Gemeente Amsterdam</d2:value></d2:values></d2:sourceName></d2:source>
  <d2:validity>
    <d2:validityStatus>definedByValidityTimeSpec</d2:validityStatus>
    <d2:validityTimeSpecification>{start}{end}</d2:validityTimeSpecification>
  </d2:validity>
  {link}
  <d2:groupOfLocations xsi:type="Point">
    <d2:locationForDisplay><d2:latitude>0.0</d2:latitude><d2:longitude>0.0</d2:longitude></d2:locationForDisplay>
    <d2:pointByCoordinates><d2:pointCoordinates>{lat}{lon}</d2:pointCoordinates></d2:pointByCoordinates>
  </d2:groupOfLocations>
  <d2:operatorActionStatus>approved</d2:operatorActionStatus>
  <d2:generalNetworkManagementType>{kind}</d2:generalNetworkManagementType>
</d2:situationRecord>"#,
                id = self.id,
                start = optional("overallStartTime", self.start),
                end = optional("overallEndTime", self.end),
                lat = optional("latitude", self.lat),
                lon = optional("longitude", self.lon),
                kind = self.management_type,
            )
        }
    }

    pub(crate) fn publication(records: &[SampleRecord<'_>]) -> String {
        let body: String = records.iter().map(SampleRecord::to_xml).collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<SOAP:Envelope xmlns:SOAP="http://schemas.xmlsoap.org/soap/envelope/">
<SOAP:Body>
<d2:d2LogicalModel xmlns:d2="http://datex2.eu/schema/2/2_0" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" modelBaseVersion="2">
<d2:payloadPublication xsi:type="SituationPublication" lang="nl">
<d2:publicationTime>2024-05-01T09:00:00Z</d2:publicationTime>
<d2:situation id="s1" version="1">{body}</d2:situation>
</d2:payloadPublication>
</d2:d2LogicalModel>
</SOAP:Body>
</SOAP:Envelope>"#
        )
    }

    #[test]
    fn parses_opening_with_link_and_point_coordinates() {
        let mut record = SampleRecord::opening(
            "NDW01_1",
            "2024-05-01T10:00:00.000+02:00",
            "2024-05-01T10:15:00Z",
        );
        record.link = Some("https://example.org/brug/1");
        let feed = normalize(publication(&[record]).as_bytes()).unwrap();

        assert_eq!(feed.dropped_count(), 0);
        assert_eq!(feed.records.len(), 1);

        let opening = &feed.records[0];
        assert_eq!(opening.record_id.as_deref(), Some("NDW01_1"));
        assert_eq!(opening.record_version.as_deref(), Some("2"));
        assert_eq!(opening.site_key(), "52.3700,4.8900");
        assert_eq!(opening.start, Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
        assert_eq!(opening.end, Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap()));
        assert_eq!(opening.source.as_deref(), Some("Gemeente Amsterdam"));
        assert_eq!(opening.operator_status.as_deref(), Some("approved"));
        assert_eq!(
            opening.links,
            vec![OpeningLink {
                url: Some("https://example.org/brug/1".to_string()),
                description: Some("Bediening".to_string()),
            }]
        );
    }

    #[test]
    fn malformed_records_are_dropped_and_counted() {
        let mut missing_start = SampleRecord::opening("b", "", "2024-05-01T10:15:00Z");
        missing_start.start = None;
        let mut missing_location =
            SampleRecord::opening("c", "2024-05-01T10:00:00Z", "2024-05-01T10:15:00Z");
        missing_location.lat = None;
        let reversed = SampleRecord::opening("d", "2024-05-01T11:00:00Z", "2024-05-01T10:00:00Z");
        let garbage_time = SampleRecord::opening("e", "tomorrow", "2024-05-01T10:00:00Z");

        let records = [
            SampleRecord::opening("a", "2024-05-01T10:00:00Z", "2024-05-01T10:15:00Z"),
            missing_start,
            missing_location,
            reversed,
            garbage_time,
            SampleRecord::opening("f", "2024-05-01T12:00:00Z", "2024-05-01T12:10:00Z"),
        ];
        let feed = normalize(publication(&records).as_bytes()).unwrap();

        assert_eq!(feed.total(), 6);
        assert_eq!(feed.records.len(), 2);
        assert_eq!(feed.dropped_count(), 4);

        let reasons: Vec<_> = feed.dropped.iter().map(|d| d.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![
                RecordValidationError::MissingStart,
                RecordValidationError::MissingLocation,
                RecordValidationError::EndBeforeStart,
                RecordValidationError::InvalidTimestamp {
                    field: "start",
                    value: "tomorrow".to_string()
                },
            ]
        );
    }

    #[test]
    fn missing_end_is_open_ended() {
        let mut record = SampleRecord::opening("a", "2024-05-01T10:00:00Z", "");
        record.end = None;
        let feed = normalize(publication(&[record]).as_bytes()).unwrap();

        assert_eq!(feed.records[0].end, None);
    }

    #[test]
    fn other_management_types_are_ignored_not_dropped() {
        let mut closure =
            SampleRecord::opening("x", "2024-05-01T10:00:00Z", "2024-05-01T11:00:00Z");
        closure.management_type = "roadClosed";
        let feed = normalize(publication(&[closure]).as_bytes()).unwrap();

        assert_eq!(feed.ignored, 1);
        assert_eq!(feed.total(), 0);
    }

    #[test]
    fn gzip_payload_is_decompressed() {
        let xml = publication(&[SampleRecord::opening(
            "a",
            "2024-05-01T10:00:00Z",
            "2024-05-01T10:15:00Z",
        )]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(xml.as_bytes()).unwrap();
        let gz = encoder.finish().unwrap();

        let feed = normalize(&gz).unwrap();
        assert_eq!(feed.records.len(), 1);
    }

    #[test]
    fn corrupt_gzip_is_a_format_error() {
        let result = normalize(&[0x1f, 0x8b, 0x08, 0x00, 0xde, 0xad]);
        assert!(matches!(result, Err(FeedFormatError::Compression(_))));
    }

    #[test]
    fn mismatched_tags_fail_the_document() {
        let xml = "<d2LogicalModel><payloadPublication><situationRecord>\
                   </payloadPublication></d2LogicalModel>";
        assert!(matches!(normalize(xml.as_bytes()), Err(FeedFormatError::Xml { .. })));
    }

    #[test]
    fn truncated_document_fails() {
        let xml = "<d2LogicalModel><payloadPublication><situationRecord id=\"a\">";
        assert!(matches!(
            normalize(xml.as_bytes()),
            Err(FeedFormatError::Truncated | FeedFormatError::Xml { .. })
        ));
    }

    #[test]
    fn non_datex_document_fails() {
        let xml = "<html><body>Service unavailable</body></html>";
        assert!(matches!(normalize(xml.as_bytes()), Err(FeedFormatError::NotAPublication)));
    }

    #[test]
    fn empty_publication_is_valid() {
        let feed = normalize(publication(&[]).as_bytes()).unwrap();
        assert_eq!(feed.total(), 0);
    }

    #[test]
    fn timestamps_without_offset_are_utc_and_truncated() {
        assert_eq!(
            parse_timestamp("2024-05-01T10:00:00.987"),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(
            parse_timestamp(" 2024-05-01T10:00:00.5Z "),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("01-05-2024"), None);
    }
}
