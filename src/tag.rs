use std::path::{Path, PathBuf};

use anyhow::anyhow;
use log::debug;

use crate::api::models::{ArtistType, TrackCredits};
use crate::error::Flaw;
use crate::models::TrackFormat;

/// Everything needed to build the ordered `-metadata` argument list for a
/// single track.
pub struct TagAttrs {
    pub artists: Vec<(String, ArtistType)>,
    pub title: String,
    pub album: String,
    pub album_artist: String,
    pub copyright: Option<String>,
    pub isrc: Option<String>,
    pub track_number: u32,
    pub total_tracks: u32,
    pub disc_number: u32,
    pub total_discs: u32,
    pub release_date: Option<String>,
    pub lyrics: String,
    pub credits: TrackCredits,
    pub version: Option<String>,
}

impl TagAttrs {
    fn artist_tag(&self) -> String {
        let (main, feat): (Vec<_>, Vec<_>) = self
            .artists
            .iter()
            .partition(|(_, kind)| *kind == ArtistType::Main);
        let mut joined = main
            .iter()
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>()
            .join(" & ");
        if !feat.is_empty() {
            let feat_names = feat
                .iter()
                .map(|(name, _)| name.clone())
                .collect::<Vec<_>>()
                .join(" & ");
            joined = format!("{joined} (feat. {feat_names})");
        }
        joined
    }

    /// Builds the stable, ordered `-metadata key=value` pairs described in
    /// the tag embedder's design: fixed head, conditional credit fields,
    /// conditional version.
    fn metadata_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("artist".to_string(), self.artist_tag()),
            ("lead_performer".to_string(), self.artist_tag()),
            ("title".to_string(), self.title.clone()),
            ("album".to_string(), self.album.clone()),
            ("album_artist".to_string(), self.album_artist.clone()),
        ];
        if let Some(copyright) = &self.copyright {
            pairs.push(("copyright".to_string(), copyright.clone()));
        }
        if let Some(isrc) = &self.isrc {
            pairs.push(("isrc".to_string(), isrc.clone()));
        }
        pairs.push(("track".to_string(), self.track_number.to_string()));
        pairs.push(("tracktotal".to_string(), self.total_tracks.to_string()));
        pairs.push(("disc".to_string(), self.disc_number.to_string()));
        pairs.push(("disctotal".to_string(), self.total_discs.to_string()));
        if let Some(date) = &self.release_date {
            pairs.push(("date".to_string(), date.clone()));
            if let Some(year) = date.split('-').next() {
                pairs.push(("year".to_string(), year.to_string()));
            }
        }
        pairs.push(("lyrics".to_string(), self.lyrics.clone()));

        if !self.credits.composers.is_empty() {
            pairs.push(("composer".to_string(), self.credits.composers.join(" & ")));
        }
        if !self.credits.lyricists.is_empty() {
            pairs.push(("lyricist".to_string(), self.credits.lyricists.join(" & ")));
        }
        if !self.credits.producers.is_empty() {
            pairs.push(("producer".to_string(), self.credits.producers.join(" & ")));
        }
        if !self.credits.additional_producers.is_empty() {
            pairs.push((
                "coproducer".to_string(),
                self.credits.additional_producers.join(" & "),
            ));
        }
        if let Some(version) = &self.version {
            pairs.push(("version".to_string(), version.clone()));
        }
        pairs
    }
}

/// Invokes `ffmpeg` to mux the cover into the audio file and set metadata,
/// then replaces `track_path` with the tagged output on success.
pub async fn embed(
    track_path: &Path,
    cover_path: &Path,
    format: TrackFormat,
    attrs: &TagAttrs,
) -> Result<(), Flaw> {
    let staged = track_path.with_extension(format.extension());

    let mut args: Vec<String> = vec![
        "-y".into(),
        "-i".into(),
        track_path.to_string_lossy().into_owned(),
        "-i".into(),
        cover_path.to_string_lossy().into_owned(),
        "-map".into(),
        "0:a".into(),
        "-map".into(),
        "1".into(),
        "-c".into(),
        "copy".into(),
        "-disposition:v".into(),
        "attached_pic".into(),
    ];
    for (key, value) in attrs.metadata_pairs() {
        args.push("-metadata".into());
        args.push(format!("{key}={value}"));
    }
    args.push(staged.to_string_lossy().into_owned());

    debug!("ffmpeg {}", args.join(" "));
    let output = tokio::process::Command::new("ffmpeg")
        .args(&args)
        .output()
        .await
        .map_err(|e| Flaw::structured("failed to spawn ffmpeg", e.into()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(Flaw::structured("ffmpeg exited with an error", anyhow!("{stderr}"))
            .with_context("exit_status", output.status.to_string()));
    }

    tokio::fs::rename(&staged, track_path)
        .await
        .map_err(|e| Flaw::structured("failed to rename tagged file into place", e.into()))?;
    Ok(())
}

pub fn staged_path(track_path: &Path, format: TrackFormat) -> PathBuf {
    track_path.with_extension(format.extension())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_attrs() -> TagAttrs {
        TagAttrs {
            artists: vec![
                ("Main Artist".into(), ArtistType::Main),
                ("Feature Artist".into(), ArtistType::Featured),
            ],
            title: "Song".into(),
            album: "Album".into(),
            album_artist: "Main Artist".into(),
            copyright: Some("(c) 2024".into()),
            isrc: Some("US1234567890".into()),
            track_number: 2,
            total_tracks: 10,
            disc_number: 1,
            total_discs: 1,
            release_date: Some("2024-05-01".into()),
            lyrics: String::new(),
            credits: TrackCredits {
                producers: vec!["Producer One".into()],
                composers: vec![],
                lyricists: vec![],
                additional_producers: vec![],
            },
            version: None,
        }
    }

    #[test]
    fn artist_tag_joins_main_and_appends_featured() {
        let attrs = sample_attrs();
        assert_eq!(attrs.artist_tag(), "Main Artist (feat. Feature Artist)");
    }

    #[test]
    fn metadata_pairs_are_stable_ordered_and_skip_empty_credit_groups() {
        let attrs = sample_attrs();
        let pairs = attrs.metadata_pairs();
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "artist",
                "lead_performer",
                "title",
                "album",
                "album_artist",
                "copyright",
                "isrc",
                "track",
                "tracktotal",
                "disc",
                "disctotal",
                "date",
                "year",
                "lyrics",
                "producer",
            ]
        );
    }

    #[test]
    fn version_is_appended_last_when_present() {
        let mut attrs = sample_attrs();
        attrs.version = Some("Deluxe".into());
        let pairs = attrs.metadata_pairs();
        assert_eq!(pairs.last().unwrap().0, "version");
    }
}
