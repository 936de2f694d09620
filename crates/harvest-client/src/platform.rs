use std::fmt;

use url::Url;

/// Hosting platform of a work item, which decides how metadata is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    YouTube,
    TikTok,
    SoundCloud,
    Dailymotion,
    Spotify,
    AppleMusic,
    Facebook,
    AmazonMusic,
    Generic,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::YouTube => "YouTube",
            Platform::TikTok => "TikTok",
            Platform::SoundCloud => "Soundcloud",
            Platform::Dailymotion => "Daily Motion",
            Platform::Spotify => "Spotify",
            Platform::AppleMusic => "Apple",
            Platform::Facebook => "Facebook",
            Platform::AmazonMusic => "Amazon",
            Platform::Generic => "Generic",
        }
    }

    /// Parse a category label as written in input sheets ("Daily Motion",
    /// "youtube", "SoundCloud"). Unknown labels yield `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        let key: String = label
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "youtube" | "yt" => Some(Platform::YouTube),
            "tiktok" => Some(Platform::TikTok),
            "soundcloud" => Some(Platform::SoundCloud),
            "dailymotion" => Some(Platform::Dailymotion),
            "spotify" => Some(Platform::Spotify),
            "apple" | "applemusic" | "itunes" => Some(Platform::AppleMusic),
            "facebook" | "fb" => Some(Platform::Facebook),
            "amazon" | "amazonmusic" => Some(Platform::AmazonMusic),
            "generic" | "other" | "web" => Some(Platform::Generic),
            _ => None,
        }
    }

    pub fn from_url(url: &Url) -> Self {
        let host = url.host_str().unwrap_or_default().to_lowercase();
        let on = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));

        if on("youtube.com") || on("youtu.be") {
            Platform::YouTube
        } else if on("tiktok.com") {
            Platform::TikTok
        } else if on("soundcloud.com") {
            Platform::SoundCloud
        } else if on("dailymotion.com") || on("dai.ly") {
            Platform::Dailymotion
        } else if on("spotify.com") {
            Platform::Spotify
        } else if on("music.apple.com") || on("itunes.apple.com") {
            Platform::AppleMusic
        } else if on("facebook.com") || on("fb.watch") {
            Platform::Facebook
        } else if host.starts_with("music.amazon.") {
            Platform::AmazonMusic
        } else {
            Platform::Generic
        }
    }

    /// The category label wins when it names a known platform; otherwise
    /// the URL host decides.
    pub fn detect(category: &str, url: &Url) -> Self {
        match Self::from_label(category) {
            Some(Platform::Generic) | None => Self::from_url(url),
            Some(platform) => platform,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
