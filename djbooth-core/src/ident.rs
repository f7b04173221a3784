use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Video identifiers are an opaque fixed-length token
    static ref VIDEO_ID_REGEX: Regex =
        Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("video id regex compiles");

    /// Playlist identifiers carry a known prefix followed by an opaque tail
    static ref PLAYLIST_ID_REGEX: Regex =
        Regex::new(r"^(?:PL|UU|LL|FL|OLAK5uy_)[A-Za-z0-9_-]{10,}$")
            .expect("playlist id regex compiles");
}

/// Returns true if the given string is a well-formed video identifier.
pub fn is_valid_video_id(id: &str) -> bool {
    VIDEO_ID_REGEX.is_match(id)
}

/// Returns true if the given string is a well-formed playlist identifier.
pub fn is_valid_playlist_id(id: &str) -> bool {
    PLAYLIST_ID_REGEX.is_match(id)
}
