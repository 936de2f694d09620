use std::time::Duration;

use harvest_core::error::AppError;
use harvest_core::models::{ExtractedFields, WorkItem};
use harvest_core::traits::{Extractor, Fetcher};
use serde::Deserialize;
use url::Url;

use crate::fetcher::validate_url;
use crate::page::{Page, format_duration, normalize_duration};
use crate::platform::Platform;

pub const ACCOUNT: &str = "account";
pub const ACCOUNT_ID: &str = "account_id";
pub const MEDIA_TITLE: &str = "media_title";
pub const MEDIA_LENGTH: &str = "media_length";

/// Columns filled by [`MetadataExtractor`].
pub const METADATA_FIELDS: [&str; 4] = [ACCOUNT, ACCOUNT_ID, MEDIA_TITLE, MEDIA_LENGTH];

const DAILYMOTION_OEMBED: &str = "https://www.dailymotion.com/services/oembed";

/// Publisher and media details found for one URL.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MediaMetadata {
    pub account: Option<String>,
    pub account_id: Option<String>,
    pub media_title: Option<String>,
    pub media_length: Option<String>,
}

impl MediaMetadata {
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.account_id.is_none()
            && self.media_title.is_none()
            && self.media_length.is_none()
    }

    /// Fill gaps in `self` from `other`.
    pub fn or(self, other: MediaMetadata) -> Self {
        Self {
            account: self.account.or(other.account),
            account_id: self.account_id.or(other.account_id),
            media_title: self.media_title.or(other.media_title),
            media_length: self.media_length.or(other.media_length),
        }
    }

    pub fn into_fields(self) -> ExtractedFields {
        [
            (ACCOUNT, self.account),
            (ACCOUNT_ID, self.account_id),
            (MEDIA_TITLE, self.media_title),
            (MEDIA_LENGTH, self.media_length),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name.to_string(), v)))
        .collect()
    }
}

#[derive(Debug, Deserialize)]
struct OEmbed {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    author_name: Option<String>,
    #[serde(default)]
    author_url: Option<String>,
}

/// Reads account and media metadata from platform pages.
#[derive(Clone)]
pub struct MetadataExtractor<F> {
    fetcher: F,
}

impl<F: Fetcher> MetadataExtractor<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    pub async fn extract_metadata(&self, item: &WorkItem) -> Result<MediaMetadata, AppError> {
        let url = validate_url(&item.target)?;
        let platform = Platform::detect(&item.category, &url);
        tracing::debug!(index = item.index, %platform, url = %url, "Reading metadata");

        match platform {
            Platform::Spotify if is_spotify_track_or_artist(&url) => {
                Err(AppError::UnsupportedContent(format!(
                    "Spotify track and artist pages carry no publisher metadata: {url}"
                )))
            }
            Platform::Dailymotion => self.dailymotion(&url).await,
            _ => {
                let html = self.fetcher.fetch(url.as_str()).await?;
                Ok(read_page(platform, &url, &html))
            }
        }
    }

    /// oEmbed first, page for whatever the API leaves out.
    async fn dailymotion(&self, url: &Url) -> Result<MediaMetadata, AppError> {
        let api = match self.oembed(url).await {
            Ok(found) => Some(found),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "oEmbed lookup failed, reading the page");
                None
            }
        };

        match (api, self.fetcher.fetch(url.as_str()).await) {
            (Some(api), Ok(html)) => Ok(api.or(read_page(Platform::Dailymotion, url, &html))),
            (Some(api), Err(e)) => {
                tracing::debug!(url = %url, error = %e, "Page fetch failed, keeping oEmbed data");
                Ok(api)
            }
            (None, Ok(html)) => Ok(read_page(Platform::Dailymotion, url, &html)),
            (None, Err(e)) => Err(e),
        }
    }

    async fn oembed(&self, url: &Url) -> Result<MediaMetadata, AppError> {
        let endpoint =
            Url::parse_with_params(DAILYMOTION_OEMBED, &[("url", url.as_str()), ("format", "json")])
                .map_err(|e| AppError::ParseError(e.to_string()))?;
        let body = self.fetcher.fetch(endpoint.as_str()).await?;
        let payload: OEmbed = serde_json::from_str(&body)
            .map_err(|e| AppError::ParseError(format!("oEmbed response: {e}")))?;

        Ok(MediaMetadata {
            account: non_blank(payload.author_name),
            account_id: payload.author_url.as_deref().and_then(last_segment),
            media_title: non_blank(payload.title),
            media_length: None,
        })
    }
}

impl<F: Fetcher> Extractor for MetadataExtractor<F> {
    fn fields(&self) -> &[&str] {
        &METADATA_FIELDS
    }

    async fn extract(&self, item: &WorkItem, _timeout: Duration) -> Result<ExtractedFields, AppError> {
        let metadata = self.extract_metadata(item).await?;
        if metadata.is_empty() {
            return Err(AppError::UnsupportedContent(format!(
                "no metadata found at {}",
                item.target
            )));
        }
        Ok(metadata.into_fields())
    }
}

fn read_page(platform: Platform, url: &Url, html: &str) -> MediaMetadata {
    let page = Page::parse(html);
    match platform {
        Platform::YouTube => youtube(&page, url, html),
        Platform::TikTok => tiktok(&page, url),
        Platform::SoundCloud => soundcloud(&page, url),
        Platform::Dailymotion => dailymotion_page(&page),
        Platform::Spotify => spotify(&page),
        Platform::AppleMusic => apple_music(&page),
        Platform::Facebook => facebook(&page),
        Platform::AmazonMusic => amazon_music(&page),
        Platform::Generic => generic(&page),
    }
}

fn youtube(page: &Page, url: &Url, html: &str) -> MediaMetadata {
    let segments = path_segments(url);
    if let [first, id, ..] = segments.as_slice()
        && *first == "channel"
    {
        return MediaMetadata {
            account: page
                .meta("property", "og:title")
                .or_else(|| page.meta("property", "og:site_name")),
            account_id: Some(id.to_string()),
            ..Default::default()
        };
    }

    let media_title = page
        .meta("property", "og:title")
        .or_else(|| page.meta("name", "title"))
        .or_else(|| page.title().map(|t| t.trim_end_matches(" - YouTube").to_string()));
    let account = page
        .attr(r#"span[itemprop="author"] link[itemprop="name"]"#, "content")
        .or_else(|| page.meta("name", "author"));
    let account_id = page
        .attr(r#"span[itemprop="author"] link[itemprop="url"]"#, "href")
        .as_deref()
        .and_then(last_segment)
        .or_else(|| page.meta("itemprop", "channelId"))
        .or_else(|| json_string_field(html, "channelId"));
    let media_length = page
        .meta("itemprop", "duration")
        .and_then(|d| normalize_duration(&d));

    MediaMetadata {
        account,
        account_id,
        media_title,
        media_length,
    }
}

fn tiktok(page: &Page, url: &Url) -> MediaMetadata {
    let account = path_segments(url)
        .into_iter()
        .find(|s| s.starts_with('@'))
        .map(str::to_string);
    let media_title = page
        .first_meta(&[
            ("property", "og:title"),
            ("name", "title"),
            ("property", "twitter:title"),
            ("name", "twitter:title"),
        ])
        .map(|t| t.trim_end_matches(" on TikTok").to_string())
        .or_else(|| {
            page.title()
                .map(|t| t.split(" | TikTok").next().unwrap_or_default().trim().to_string())
                .filter(|t| !t.is_empty() && t != "TikTok")
        });
    let media_length = page
        .first_meta(&[
            ("property", "video:duration"),
            ("name", "duration"),
            ("property", "og:video:duration"),
        ])
        .and_then(|d| normalize_duration(&d));

    MediaMetadata {
        account,
        account_id: None,
        media_title,
        media_length,
    }
}

fn soundcloud(page: &Page, url: &Url) -> MediaMetadata {
    let segments = path_segments(url);
    let account = (segments.len() >= 2).then(|| segments[0].to_string());
    let media_length = hydration_duration(page).or_else(|| {
        page.first_meta(&[
            ("property", "music:duration"),
            ("name", "duration"),
            ("property", "og:video:duration"),
        ])
        .and_then(|d| normalize_duration(&d))
    });

    MediaMetadata {
        account,
        account_id: None,
        media_title: page.meta("property", "og:title"),
        media_length,
    }
}

/// Track length from the `window.__sc_hydration` bootstrap array.
fn hydration_duration(page: &Page) -> Option<String> {
    page.scripts().iter().find_map(|script| {
        let start = script.find("window.__sc_hydration")?;
        let (_, json) = script[start..].split_once('=')?;
        let data: serde_json::Value = serde_json::Deserializer::from_str(json.trim_start())
            .into_iter()
            .next()?
            .ok()?;
        data.as_array()?
            .iter()
            .find(|entry| entry["hydratable"] == "sound")
            .and_then(|entry| entry["data"]["duration"].as_u64())
            .map(|ms| format_duration(ms / 1000))
    })
}

fn dailymotion_page(page: &Page) -> MediaMetadata {
    MediaMetadata {
        account: page.first_meta(&[
            ("name", "author"),
            ("property", "video:channel"),
            ("property", "og:author"),
        ]),
        account_id: None,
        media_title: page.meta("property", "og:title"),
        media_length: page
            .first_meta(&[
                ("property", "video:duration"),
                ("property", "og:video:duration"),
                ("name", "duration"),
                ("itemprop", "duration"),
            ])
            .and_then(|d| normalize_duration(&d)),
    }
}

fn spotify(page: &Page) -> MediaMetadata {
    let account = page
        .meta("name", "description")
        .and_then(|d| d.split('·').nth(2).map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty());
    MediaMetadata {
        account,
        account_id: page
            .meta("name", "music:musician")
            .as_deref()
            .and_then(last_segment),
        media_title: page.meta("property", "og:title"),
        media_length: page
            .meta("name", "music:duration")
            .and_then(|d| normalize_duration(&d)),
    }
}

fn is_spotify_track_or_artist(url: &Url) -> bool {
    path_segments(url)
        .iter()
        .any(|s| matches!(*s, "track" | "artist"))
}

fn apple_music(page: &Page) -> MediaMetadata {
    MediaMetadata {
        account: page
            .meta("property", "og:description")
            .and_then(|d| artist_from_description(&d)),
        account_id: page
            .meta("property", "music:musician")
            .as_deref()
            .and_then(last_segment),
        media_title: page.meta("property", "og:title"),
        media_length: page
            .meta("property", "music:duration")
            .and_then(|d| normalize_duration(&d)),
    }
}

/// "Listen to Bing Bong Song by Peppa Pig on Apple Music. 2019." gives "Peppa Pig".
fn artist_from_description(description: &str) -> Option<String> {
    let (_, after) = description.rsplit_once(" by ")?;
    let name = after.split('.').next().unwrap_or(after);
    let name = name.split(" on Apple Music").next().unwrap_or(name);
    non_blank(Some(name.to_string()))
}

const FACEBOOK_PEOPLE: &str = "https://www.facebook.com/people/";

fn facebook(page: &Page) -> MediaMetadata {
    let (account, account_id) = page
        .attr(&format!(r#"a[href^="{FACEBOOK_PEOPLE}"]"#), "href")
        .map(|href| facebook_person(&href))
        .unwrap_or_default();
    MediaMetadata {
        account,
        account_id,
        media_title: page.meta("property", "og:title"),
        media_length: page
            .first_meta(&[("property", "video:duration"), ("property", "og:video:duration")])
            .and_then(|d| normalize_duration(&d)),
    }
}

/// `people/<name>/<id>/` link to display name and numeric id.
fn facebook_person(href: &str) -> (Option<String>, Option<String>) {
    let rest = href.strip_prefix(FACEBOOK_PEOPLE).unwrap_or(href);
    let mut parts = rest.split(['/', '?']).filter(|p| !p.is_empty());
    let name = parts
        .next()
        .map(|n| urlencoding::decode(n).map(|d| d.into_owned()).unwrap_or_else(|_| n.to_string()));
    let id = parts
        .next()
        .filter(|id| id.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string);
    (non_blank(name), id)
}

const AMAZON_ARTISTS: &str = "/artists/";

fn amazon_music(page: &Page) -> MediaMetadata {
    let artist_url = page
        .scripts_of_type("application/ld+json")
        .iter()
        .filter_map(|body| serde_json::from_str::<serde_json::Value>(body).ok())
        .find_map(|doc| by_artist_url(&doc));
    let (account_id, account) = artist_url
        .as_deref()
        .map(amazon_artist)
        .unwrap_or_default();
    MediaMetadata {
        account,
        account_id,
        media_title: page.meta("property", "og:title"),
        media_length: None,
    }
}

/// `byArtist.url` of an ld+json document, which may be a list of documents
/// and may name several artists.
fn by_artist_url(doc: &serde_json::Value) -> Option<String> {
    if let Some(docs) = doc.as_array() {
        return docs.iter().find_map(by_artist_url);
    }
    let artist = doc.get("byArtist")?;
    let artist = artist.as_array().and_then(|a| a.first()).unwrap_or(artist);
    artist.get("url")?.as_str().map(str::to_string)
}

/// `https://music.amazon.com/artists/<id>/<name>` to `(id, name)`.
fn amazon_artist(link: &str) -> (Option<String>, Option<String>) {
    let Some((_, rest)) = link.split_once(AMAZON_ARTISTS) else {
        return (None, None);
    };
    let mut parts = rest.split(['/', '?']).filter(|p| !p.is_empty());
    let id = parts.next().map(str::to_string);
    let name = parts.next().map(str::to_string);
    (non_blank(id), non_blank(name))
}

fn generic(page: &Page) -> MediaMetadata {
    MediaMetadata {
        account: page.first_meta(&[("name", "author"), ("property", "og:site_name")]),
        account_id: None,
        media_title: page.meta("property", "og:title").or_else(|| page.title()),
        media_length: page
            .first_meta(&[
                ("property", "video:duration"),
                ("property", "og:video:duration"),
                ("property", "music:duration"),
                ("itemprop", "duration"),
            ])
            .and_then(|d| normalize_duration(&d)),
    }
}

fn path_segments(url: &Url) -> Vec<&str> {
    url.path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn last_segment(link: &str) -> Option<String> {
    link.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .map(str::to_string)
}

/// Value of the first `"key":"value"` pair in an inline JSON blob.
fn json_string_field(source: &str, key: &str) -> Option<String> {
    let needle = format!(r#""{key}":""#);
    let start = source.find(&needle)? + needle.len();
    let end = source[start..].find('"')?;
    non_blank(Some(source[start..start + end].to_string()))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::testutil::MockFetcher;

    const YOUTUBE_HTML: &str = r#"<html><head>
        <meta property="og:title" content="Peppa Pig Official Song">
        <meta itemprop="duration" content="PT3M7S">
        </head><body>
        <span itemprop="author" itemscope itemtype="http://schema.org/Person">
          <link itemprop="url" href="http://www.youtube.com/@peppapig">
          <link itemprop="name" content="Peppa Pig - Official Channel">
        </span>
        <script>var ytInitialData = {"channelId":"UCAOtE1V7Ots4DjM8JLlrYgg"};</script>
        </body></html>"#;

    fn item(category: &str, url: &str) -> WorkItem {
        WorkItem::new(0, category, url)
    }

    #[tokio::test]
    async fn test_youtube_video() {
        let extractor = MetadataExtractor::new(MockFetcher::new(YOUTUBE_HTML));
        let meta = extractor
            .extract_metadata(&item("YouTube", "https://www.youtube.com/watch?v=abc"))
            .await
            .unwrap();

        assert_eq!(meta.media_title.as_deref(), Some("Peppa Pig Official Song"));
        assert_eq!(meta.account.as_deref(), Some("Peppa Pig - Official Channel"));
        assert_eq!(meta.account_id.as_deref(), Some("@peppapig"));
        assert_eq!(meta.media_length.as_deref(), Some("3:07"));
    }

    #[tokio::test]
    async fn test_youtube_channel_id_from_inline_json() {
        let html = r#"<html><head><meta property="og:title" content="Clip"></head>
            <body><script>{"channelId":"UC123"}</script></body></html>"#;
        let extractor = MetadataExtractor::new(MockFetcher::new(html));
        let meta = extractor
            .extract_metadata(&item("", "https://youtu.be/abc"))
            .await
            .unwrap();
        assert_eq!(meta.account_id.as_deref(), Some("UC123"));
    }

    #[tokio::test]
    async fn test_youtube_channel_page() {
        let html = r#"<html><head><meta property="og:title" content="Kids Channel"></head></html>"#;
        let extractor = MetadataExtractor::new(MockFetcher::new(html));
        let meta = extractor
            .extract_metadata(&item("YouTube", "https://www.youtube.com/channel/UCxyz/videos"))
            .await
            .unwrap();
        assert_eq!(meta.account.as_deref(), Some("Kids Channel"));
        assert_eq!(meta.account_id.as_deref(), Some("UCxyz"));
        assert_eq!(meta.media_title, None);
    }

    #[tokio::test]
    async fn test_tiktok() {
        let html = r#"<html><head>
            <meta property="og:title" content="Dance challenge on TikTok">
            <meta property="video:duration" content="42">
            </head></html>"#;
        let extractor = MetadataExtractor::new(MockFetcher::new(html));
        let meta = extractor
            .extract_metadata(&item("TikTok", "https://www.tiktok.com/@dancer/video/7123"))
            .await
            .unwrap();
        assert_eq!(meta.account.as_deref(), Some("@dancer"));
        assert_eq!(meta.media_title.as_deref(), Some("Dance challenge"));
        assert_eq!(meta.media_length.as_deref(), Some("0:42"));
    }

    #[tokio::test]
    async fn test_tiktok_title_fallback() {
        let html = "<html><head><title>Cooking tips | TikTok</title></head></html>";
        let extractor = MetadataExtractor::new(MockFetcher::new(html));
        let meta = extractor
            .extract_metadata(&item("TikTok", "https://www.tiktok.com/@chef/video/1"))
            .await
            .unwrap();
        assert_eq!(meta.media_title.as_deref(), Some("Cooking tips"));
    }

    #[tokio::test]
    async fn test_soundcloud_hydration() {
        let html = r#"<html><head><meta property="og:title" content="Night Drive"></head><body>
            <script>window.__sc_hydration = [{"hydratable":"user","data":{}},{"hydratable":"sound","data":{"duration":245321,"title":"a;b"}}];</script>
            </body></html>"#;
        let extractor = MetadataExtractor::new(MockFetcher::new(html));
        let meta = extractor
            .extract_metadata(&item("Soundcloud", "https://soundcloud.com/some-artist/night-drive"))
            .await
            .unwrap();
        assert_eq!(meta.account.as_deref(), Some("some-artist"));
        assert_eq!(meta.media_title.as_deref(), Some("Night Drive"));
        assert_eq!(meta.media_length.as_deref(), Some("4:05"));
    }

    #[tokio::test]
    async fn test_dailymotion_oembed_then_page() {
        let oembed = r#"{"title":"Goal of the week","author_name":"Sports Daily","author_url":"https://www.dailymotion.com/sportsdaily"}"#;
        let page = r#"<html><head><meta property="video:duration" content="95"></head></html>"#;
        let fetcher = MockFetcher::with_responses(vec![Ok(oembed.into()), Ok(page.into())]);
        let extractor = MetadataExtractor::new(fetcher.clone());

        let meta = extractor
            .extract_metadata(&item("Daily Motion", "https://www.dailymotion.com/video/x8abc"))
            .await
            .unwrap();

        assert_eq!(meta.account.as_deref(), Some("Sports Daily"));
        assert_eq!(meta.account_id.as_deref(), Some("sportsdaily"));
        assert_eq!(meta.media_title.as_deref(), Some("Goal of the week"));
        assert_eq!(meta.media_length.as_deref(), Some("1:35"));

        let requested = fetcher.requested.lock().unwrap().clone();
        assert!(requested[0].starts_with(DAILYMOTION_OEMBED));
        assert!(requested[0].contains("format=json"));
        assert_eq!(requested[1], "https://www.dailymotion.com/video/x8abc");
    }

    #[tokio::test]
    async fn test_dailymotion_falls_back_to_page() {
        let page = r#"<html><head>
            <meta property="og:title" content="Fallback title">
            <meta name="author" content="Uploader">
            </head></html>"#;
        let fetcher = MockFetcher::with_responses(vec![
            Err(AppError::HttpStatus {
                status: 404,
                url: DAILYMOTION_OEMBED.into(),
            }),
            Ok(page.into()),
        ]);
        let extractor = MetadataExtractor::new(fetcher);

        let meta = extractor
            .extract_metadata(&item("", "https://www.dailymotion.com/video/x8abc"))
            .await
            .unwrap();
        assert_eq!(meta.account.as_deref(), Some("Uploader"));
        assert_eq!(meta.media_title.as_deref(), Some("Fallback title"));
    }

    #[tokio::test]
    async fn test_empty_url_is_invalid_item_without_fetching() {
        let fetcher = MockFetcher::new("<html></html>");
        let extractor = MetadataExtractor::new(fetcher.clone());

        let err = extractor
            .extract(&item("YouTube", ""), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidItem(_)));
        assert!(fetcher.requested.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_page_without_metadata_is_unsupported() {
        let extractor = MetadataExtractor::new(MockFetcher::new("<html><body>nothing</body></html>"));
        let err = extractor
            .extract(&item("", "https://example.com/page"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedContent(_)));
    }

    #[tokio::test]
    async fn test_fetch_errors_propagate_for_retry() {
        let extractor = MetadataExtractor::new(MockFetcher::with_error(AppError::RateLimitExceeded));
        let err = extractor
            .extract(&item("TikTok", "https://www.tiktok.com/@a/video/1"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_extract_returns_only_found_fields() {
        let html = r#"<html><head><meta property="og:title" content="Hello"><meta name="author" content="Me"></head></html>"#;
        let extractor = MetadataExtractor::new(MockFetcher::new(html));
        let fields = extractor
            .extract(&item("", "https://blog.example.com/post"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(fields.get(MEDIA_TITLE).map(String::as_str), Some("Hello"));
        assert_eq!(fields.get(ACCOUNT).map(String::as_str), Some("Me"));
        assert!(!fields.contains_key(MEDIA_LENGTH));
        assert_eq!(extractor.fields(), METADATA_FIELDS);
    }

    #[tokio::test]
    async fn test_apple_music() {
        let html = r#"<html><head>
            <meta property="og:title" content="Bing Bong Song">
            <meta property="og:description" content="Listen to Bing Bong Song by Peppa Pig on Apple Music. 2019. Duration: 2:13">
            <meta property="music:musician" content="https://music.apple.com/gb/artist/peppa-pig/1033452698">
            <meta property="music:duration" content="133">
            </head></html>"#;
        let extractor = MetadataExtractor::new(MockFetcher::new(html));
        let meta = extractor
            .extract_metadata(&item(
                "Apple",
                "https://music.apple.com/gb/album/bing-bong-song/1470170937?i=1470170940",
            ))
            .await
            .unwrap();
        assert_eq!(meta.account.as_deref(), Some("Peppa Pig"));
        assert_eq!(meta.account_id.as_deref(), Some("1033452698"));
        assert_eq!(meta.media_title.as_deref(), Some("Bing Bong Song"));
        assert_eq!(meta.media_length.as_deref(), Some("2:13"));
    }

    #[tokio::test]
    async fn test_facebook_people_link() {
        let html = r#"<html><head>
            <meta property="og:title" content="Peppa's muddy puddles">
            <meta property="video:duration" content="95">
            </head><body>
            <a href="https://www.facebook.com/watch/">Watch</a>
            <a href="https://www.facebook.com/people/Peppa-Pig-Espa%C3%B1ol/100064601234567/">Peppa</a>
            </body></html>"#;
        let extractor = MetadataExtractor::new(MockFetcher::new(html));
        let meta = extractor
            .extract_metadata(&item("", "https://www.facebook.com/watch/?v=123"))
            .await
            .unwrap();
        assert_eq!(meta.account.as_deref(), Some("Peppa-Pig-Español"));
        assert_eq!(meta.account_id.as_deref(), Some("100064601234567"));
        assert_eq!(meta.media_title.as_deref(), Some("Peppa's muddy puddles"));
        assert_eq!(meta.media_length.as_deref(), Some("1:35"));
    }

    #[tokio::test]
    async fn test_amazon_music_ld_json() {
        let html = r#"<html><head>
            <meta property="og:title" content="Muddy Puddles">
            <script type="application/ld+json">{not json</script>
            <script type="application/ld+json">{"@type":"WebSite","name":"Amazon Music"}</script>
            <script type="application/ld+json">
              {"@type":"MusicRecording","name":"Muddy Puddles",
               "byArtist":{"@type":"MusicGroup","url":"https://music.amazon.com/artists/B00ABC1234/peppa-pig"}}
            </script>
            </head></html>"#;
        let extractor = MetadataExtractor::new(MockFetcher::new(html));
        let meta = extractor
            .extract_metadata(&item("Amazon", "https://music.amazon.com/albums/B0XYZ"))
            .await
            .unwrap();
        assert_eq!(meta.account.as_deref(), Some("peppa-pig"));
        assert_eq!(meta.account_id.as_deref(), Some("B00ABC1234"));
        assert_eq!(meta.media_title.as_deref(), Some("Muddy Puddles"));
    }

    #[tokio::test]
    async fn test_spotify_track_is_unsupported_without_fetching() {
        let fetcher = MockFetcher::new("<html></html>");
        let extractor = MetadataExtractor::new(fetcher.clone());

        for url in [
            "https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC",
            "https://open.spotify.com/intl-de/artist/0gxyHStUsqpMadRV0Di1Qt",
        ] {
            let err = extractor
                .extract(&item("Spotify", url), Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::UnsupportedContent(_)));
        }
        assert!(fetcher.requested.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spotify_episode() {
        let html = r#"<html><head>
            <meta property="og:title" content="Episode 1">
            <meta name="description" content="Listen to this episode · Podcast · Peppa Pig Stories">
            <meta name="music:musician" content="https://open.spotify.com/artist/0gxyHStUsqpMadRV0Di1Qt">
            </head></html>"#;
        let extractor = MetadataExtractor::new(MockFetcher::new(html));
        let meta = extractor
            .extract_metadata(&item("Spotify", "https://open.spotify.com/episode/5Xt5DXGzch68nYYamXrNxZ"))
            .await
            .unwrap();
        assert_eq!(meta.account.as_deref(), Some("Peppa Pig Stories"));
        assert_eq!(meta.account_id.as_deref(), Some("0gxyHStUsqpMadRV0Di1Qt"));
    }

    #[test]
    fn test_artist_from_description() {
        assert_eq!(
            artist_from_description("Song · 2020 by The Band. Listen now").as_deref(),
            Some("The Band")
        );
        assert_eq!(artist_from_description("No artist here"), None);
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("https://x.com/a/b/").as_deref(), Some("b"));
        assert_eq!(last_segment("https://"), None);
    }
}
