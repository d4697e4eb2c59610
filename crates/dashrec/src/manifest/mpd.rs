use std::sync::LazyLock;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use tracing::{trace, warn};

use super::{ExtractedTracks, FormatSelector, TrackExtractor};
use crate::error::LiveError;
use crate::model::{ChunkRef, TrackKind};

static SEQUENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/sq/(\d+)(?:/|$)").unwrap());

/// One `Representation` of a `SegmentList` based MPD.
#[derive(Debug, Clone, Default)]
pub(crate) struct Representation {
    pub id: String,
    pub bandwidth: u64,
    pub kind: TrackKind,
    pub chunks: Vec<ChunkRef>,
}

#[derive(Debug, Default)]
struct RepresentationBuilder {
    id: String,
    bandwidth: u64,
    kind: Option<TrackKind>,
    base_url: Option<String>,
    start_number: Option<u64>,
    media: Vec<String>,
}

impl RepresentationBuilder {
    fn finish(self, inherited_base: &str) -> Option<Representation> {
        let kind = self.kind?;
        let base = self.base_url.as_deref().unwrap_or(inherited_base);
        let chunks = self
            .media
            .iter()
            .enumerate()
            .filter_map(|(index, media)| {
                let url = format!("{base}{media}");
                let id = sequence_id_of(&url).or_else(|| {
                    self.start_number
                        .and_then(|start| start.checked_add(index as u64))
                });
                match id {
                    Some(id) => Some(ChunkRef::new(kind, id, url)),
                    None => {
                        warn!(url = %url, "Skipping chunk without a sequence id");
                        None
                    }
                }
            })
            .collect();
        Some(Representation {
            id: self.id,
            bandwidth: self.bandwidth,
            kind,
            chunks,
        })
    }
}

/// Reads the sequence id from a `/sq/<n>/` path component.
pub(crate) fn sequence_id_of(url: &str) -> Option<u64> {
    SEQUENCE_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn kind_from_mime(mime: &str) -> Option<TrackKind> {
    if mime.starts_with("video") {
        Some(TrackKind::Video)
    } else if mime.starts_with("audio") {
        Some(TrackKind::Audio)
    } else {
        None
    }
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Walks a `SegmentList` MPD and returns the chunks of the selected
/// video and audio representations.
#[derive(Debug, Clone, Default)]
pub struct MpdExtractor {
    selector: FormatSelector,
}

impl MpdExtractor {
    pub fn new(selector: FormatSelector) -> Self {
        Self { selector }
    }

    pub(crate) fn parse(manifest: &[u8]) -> Result<(Vec<Representation>, bool), LiveError> {
        let text = std::str::from_utf8(manifest)
            .map_err(|e| LiveError::manifest_parse(format!("manifest is not UTF-8: {e}")))?;
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut is_final = false;
        let mut saw_mpd = false;
        let mut representations = Vec::new();

        let mut mpd_base = String::new();
        let mut adaptation_base: Option<String> = None;
        let mut adaptation_kind: Option<TrackKind> = None;
        let mut current: Option<RepresentationBuilder> = None;
        let mut in_base_url = false;

        loop {
            let event = reader.read_event().map_err(|e| {
                LiveError::manifest_parse(format!(
                    "XML error at position {}: {e}",
                    reader.error_position()
                ))
            })?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let is_empty = matches!(event, Event::Empty(_));
                    match e.local_name().as_ref() {
                        b"MPD" => {
                            saw_mpd = true;
                            is_final = attr(e, b"type").as_deref() == Some("static");
                        }
                        b"AdaptationSet" => {
                            adaptation_kind = attr(e, b"mimeType")
                                .or_else(|| attr(e, b"contentType"))
                                .as_deref()
                                .and_then(kind_from_mime);
                            adaptation_base = None;
                        }
                        b"Representation" => {
                            let builder = RepresentationBuilder {
                                id: attr(e, b"id").unwrap_or_default(),
                                bandwidth: attr(e, b"bandwidth")
                                    .and_then(|b| b.parse().ok())
                                    .unwrap_or(0),
                                kind: attr(e, b"mimeType")
                                    .as_deref()
                                    .and_then(kind_from_mime)
                                    .or(adaptation_kind),
                                ..Default::default()
                            };
                            if is_empty {
                                let inherited = adaptation_base.as_deref().unwrap_or(&mpd_base);
                                representations.extend(builder.finish(inherited));
                            } else {
                                current = Some(builder);
                            }
                        }
                        b"BaseURL" if !is_empty => in_base_url = true,
                        b"SegmentList" => {
                            if let Some(rep) = current.as_mut() {
                                rep.start_number =
                                    attr(e, b"startNumber").and_then(|n| n.parse().ok());
                            }
                        }
                        b"SegmentURL" => {
                            if let Some(rep) = current.as_mut()
                                && let Some(media) = attr(e, b"media")
                            {
                                rep.media.push(media);
                            }
                        }
                        _ => {}
                    }
                }
                Event::Text(ref t) if in_base_url => {
                    let value = t
                        .unescape()
                        .map_err(|e| LiveError::manifest_parse(format!("bad BaseURL: {e}")))?
                        .into_owned();
                    if let Some(rep) = current.as_mut() {
                        rep.base_url = Some(value);
                    } else if adaptation_kind.is_some() {
                        adaptation_base = Some(value);
                    } else {
                        mpd_base = value;
                    }
                }
                Event::End(ref e) => match e.local_name().as_ref() {
                    b"BaseURL" => in_base_url = false,
                    b"Representation" => {
                        if let Some(builder) = current.take() {
                            let inherited = adaptation_base.as_deref().unwrap_or(&mpd_base);
                            representations.extend(builder.finish(inherited));
                        }
                    }
                    b"AdaptationSet" => {
                        adaptation_kind = None;
                        adaptation_base = None;
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        if !saw_mpd {
            return Err(LiveError::manifest_parse("document has no MPD element"));
        }

        representations.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
        Ok((representations, is_final))
    }
}

impl TrackExtractor for MpdExtractor {
    fn extract(&self, manifest: &[u8]) -> Result<ExtractedTracks, LiveError> {
        let (representations, is_final) = Self::parse(manifest)?;

        let (videos, audios): (Vec<_>, Vec<_>) = representations
            .into_iter()
            .partition(|r| r.kind == TrackKind::Video);

        let video = self
            .selector
            .select(&videos)
            .ok_or_else(|| LiveError::manifest_parse("manifest has no video representation"))?;
        let audio = self
            .selector
            .select(&audios)
            .ok_or_else(|| LiveError::manifest_parse("manifest has no audio representation"))?;

        trace!(
            video = %video.id,
            audio = %audio.id,
            video_chunks = video.chunks.len(),
            audio_chunks = audio.chunks.len(),
            is_final,
            "Extracted tracks"
        );

        Ok(ExtractedTracks {
            video: video.chunks.clone(),
            audio: audio.chunks.clone(),
            is_final,
        })
    }
}
