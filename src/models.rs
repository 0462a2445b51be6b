use std::str::FromStr;

use crate::error::Flaw;

/// The four kinds of TIDAL resource a chat link can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Track,
    Album,
    Playlist,
    Mix,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Kind::Track => "track",
            Kind::Album => "album",
            Kind::Playlist => "playlist",
            Kind::Mix => "mix",
        };
        f.write_str(s)
    }
}

impl FromStr for Kind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "track" => Ok(Kind::Track),
            "album" => Ok(Kind::Album),
            "playlist" => Ok(Kind::Playlist),
            "mix" => Ok(Kind::Mix),
            _ => Err(()),
        }
    }
}

/// A parsed reference to a single catalog resource, as extracted from an
/// inbound chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub kind: Kind,
    pub id: String,
}

const ALLOWED_HOSTS: &[&str] = &["tidal.com", "listen.tidal.com", "www.tidal.com"];

impl Link {
    /// Cheap predicate used to decide whether an inbound message should even
    /// be handed to `parse` - not a full validity check.
    pub fn looks_like_link(text: &str) -> bool {
        let text = text.trim();
        text.starts_with("https://") && ALLOWED_HOSTS.iter().any(|h| text.contains(h))
    }

    pub fn parse(text: &str) -> Result<Link, Flaw> {
        let text = text.trim();
        let url = url_parse(text)
            .ok_or_else(|| Flaw::InvalidLink(format!("not a url: {text}")))?;

        if url.scheme != "https" {
            return Err(Flaw::InvalidLink(format!(
                "unsupported scheme: {}",
                url.scheme
            )));
        }
        if !ALLOWED_HOSTS.contains(&url.host.as_str()) {
            return Err(Flaw::InvalidLink(format!("unsupported host: {}", url.host)));
        }

        let path = url.path.strip_prefix("/browse/").unwrap_or(&url.path);
        let path = path.trim_start_matches('/');
        let mut segments = path.splitn(2, '/');
        let kind_str = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Flaw::InvalidLink(format!("missing resource kind in {text}")))?;
        let id = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Flaw::InvalidLink(format!("missing resource id in {text}")))?;
        // drop any trailing query string or fragment glued onto the id segment
        let id = id
            .split(['?', '#'])
            .next()
            .unwrap_or(id)
            .trim_end_matches('/');

        let kind = Kind::from_str(kind_str)
            .map_err(|_| Flaw::InvalidLink(format!("unknown resource kind: {kind_str}")))?;

        Ok(Link {
            kind,
            id: id.to_string(),
        })
    }
}

/// A minimal URL splitter. We only ever receive `https://host[/path]` shaped
/// strings here, so a full `url` crate dependency would buy us nothing the
/// teacher doesn't already avoid for equally small jobs (see `shellexpand`
/// usage in config.rs for the same philosophy).
struct SplitUrl {
    scheme: String,
    host: String,
    path: String,
}

fn url_parse(text: &str) -> Option<SplitUrl> {
    let (scheme, rest) = text.split_once("://")?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let host = authority.split('@').last()?.split(':').next()?.to_string();
    Some(SplitUrl {
        scheme: scheme.to_string(),
        host,
        path: path.to_string(),
    })
}

/// The resolved container/codec pair a stream manifest settles on, and the
/// file extension that implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackFormat {
    Mp4(Mp4Codec),
    Flac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mp4Codec {
    Eac3,
    Aac,
    Alac,
    Flac,
}

impl TrackFormat {
    pub fn from_mime_and_codec(mime_type: &str, codec: &str) -> Result<TrackFormat, Flaw> {
        match (mime_type, codec.to_ascii_lowercase().as_str()) {
            ("audio/mp4", "eac3") => Ok(TrackFormat::Mp4(Mp4Codec::Eac3)),
            ("audio/mp4", "aac") => Ok(TrackFormat::Mp4(Mp4Codec::Aac)),
            ("audio/mp4", "alac") => Ok(TrackFormat::Mp4(Mp4Codec::Alac)),
            ("audio/mp4", "flac") => Ok(TrackFormat::Mp4(Mp4Codec::Flac)),
            ("audio/flac", _) => Ok(TrackFormat::Flac),
            _ => Err(Flaw::structured(
                "unsupported track format",
                anyhow::anyhow!("mime_type={mime_type} codec={codec}"),
            )),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            TrackFormat::Mp4(_) => "m4a",
            TrackFormat::Flac => "flac",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_album_link_on_bare_host() {
        let link = Link::parse("https://tidal.com/browse/album/42").unwrap();
        assert_eq!(link.kind, Kind::Album);
        assert_eq!(link.id, "42");
    }

    #[test]
    fn parses_album_link_on_listen_host() {
        let link = Link::parse("https://listen.tidal.com/album/42").unwrap();
        assert_eq!(link.kind, Kind::Album);
        assert_eq!(link.id, "42");
    }

    #[test]
    fn rejects_wrong_scheme() {
        assert!(Link::parse("http://tidal.com/album/42").is_err());
    }

    #[test]
    fn rejects_wrong_host() {
        assert!(Link::parse("https://spotify.com/album/42").is_err());
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(Link::parse("https://tidal.com/video/42").is_err());
    }

    #[test]
    fn track_format_maps_known_combinations() {
        assert_eq!(
            TrackFormat::from_mime_and_codec("audio/mp4", "AAC").unwrap(),
            TrackFormat::Mp4(Mp4Codec::Aac)
        );
        assert_eq!(
            TrackFormat::from_mime_and_codec("audio/flac", "flac").unwrap(),
            TrackFormat::Flac
        );
        assert_eq!(
            TrackFormat::from_mime_and_codec("audio/mp4", "FLAC").unwrap(),
            TrackFormat::Mp4(Mp4Codec::Flac)
        );
        assert!(TrackFormat::from_mime_and_codec("audio/ogg", "vorbis").is_err());
    }
}
