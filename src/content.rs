use std::collections::HashSet;

use regex::{Captures, Regex};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::types::{Entry, MediaCandidate, MediaKind, ProcessedEntry, Result};

/// Scans entry bodies for embeddable media and produces the HTML and plain
/// text renditions used by the digest. Bodies are treated as opaque text;
/// everything here is regex-based scanning and rewriting.
pub struct ContentProcessor {
    img_src: Regex,
    iframe: Regex,
    iframe_src: Regex,
    youtube_embed: Regex,
    youtube_watch: Regex,
    youtube_short: Regex,
    vimeo: Regex,
    entity: Regex,
    br: Regex,
    p_close: Regex,
    tag: Regex,
    spaces: Regex,
    blank_lines: Regex,
}

struct VideoRef {
    content_id: String,
    thumbnail: String,
}

impl ContentProcessor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            img_src: Regex::new(r#"(?i)<img[^>]+src=["']([^"']+)["']"#)?,
            // Self-closing form first, so a lone <iframe ... /> cannot
            // swallow everything up to some later closing tag.
            iframe: Regex::new(r#"(?is)<iframe[^>]*/>|<iframe[^>]*>.*?</iframe>"#)?,
            iframe_src: Regex::new(r#"(?i)src=["']([^"']+)["']"#)?,
            youtube_embed: Regex::new(
                r#"(?:https?://)?(?:www\.)?youtube\.com/embed/([a-zA-Z0-9_-]+)"#,
            )?,
            youtube_watch: Regex::new(
                r#"(?:https?://)?(?:www\.)?youtube\.com/watch\?v=([a-zA-Z0-9_-]+)"#,
            )?,
            youtube_short: Regex::new(r#"(?:https?://)?youtu\.be/([a-zA-Z0-9_-]+)"#)?,
            vimeo: Regex::new(r#"(?:https?://)?(?:www\.|player\.)?vimeo\.com/(?:video/)?(\d+)"#)?,
            entity: Regex::new(r#"&(#[xX]?[0-9a-fA-F]+|[a-zA-Z][a-zA-Z0-9]*);"#)?,
            br: Regex::new(r#"(?i)<br\s*/?>"#)?,
            p_close: Regex::new(r#"(?i)</p\s*>"#)?,
            tag: Regex::new(r#"<[^>]+>"#)?,
            spaces: Regex::new(r#"[ \t]{2,}"#)?,
            blank_lines: Regex::new(r#"\n{3,}"#)?,
        })
    }

    pub fn process(&self, entry: &Entry) -> ProcessedEntry {
        let mut candidates = Vec::new();
        self.collect_images(&entry.body, &entry.link, &mut candidates);

        let mut seen_videos = HashSet::new();
        let html = self.rewrite_iframes(&entry.body, &entry.link, &mut candidates, &mut seen_videos);
        let html = self.append_video_thumbnails(html, &mut candidates, &mut seen_videos);

        let text = self.text_rendition(&entry.body);

        ProcessedEntry {
            entry: entry.clone(),
            html,
            text,
            media: candidates,
        }
    }

    /// Resolves HTML entities in a single pass, so already-decoded input
    /// never decodes twice. Unknown entities are left untouched.
    pub fn decode_entities(&self, input: &str) -> String {
        self.entity
            .replace_all(input, |caps: &Captures| {
                let name = &caps[1];
                match name {
                    "amp" => "&".to_string(),
                    "lt" => "<".to_string(),
                    "gt" => ">".to_string(),
                    "quot" => "\"".to_string(),
                    "apos" => "'".to_string(),
                    "nbsp" => " ".to_string(),
                    _ => match name.strip_prefix('#') {
                        Some(rest) => {
                            let parsed = match rest.strip_prefix('x').or_else(|| rest.strip_prefix('X')) {
                                Some(hex) => u32::from_str_radix(hex, 16),
                                None => rest.parse::<u32>(),
                            };
                            parsed
                                .ok()
                                .and_then(char::from_u32)
                                .map(|c| c.to_string())
                                .unwrap_or_else(|| caps[0].to_string())
                        }
                        None => caps[0].to_string(),
                    },
                }
            })
            .to_string()
    }

    /// Plain text rendition of an HTML body: line breaks kept, tags
    /// stripped, entities decoded, blank runs collapsed.
    pub fn text_rendition(&self, body: &str) -> String {
        let text = self.br.replace_all(body, "\n");
        let text = self.p_close.replace_all(&text, "\n\n");
        let text = self.tag.replace_all(&text, "");
        let text = self.decode_entities(&text);
        let text = self.spaces.replace_all(&text, " ");
        let text = self.blank_lines.replace_all(&text, "\n\n");
        text.trim().to_string()
    }

    fn collect_images(&self, body: &str, entry_link: &str, candidates: &mut Vec<MediaCandidate>) {
        for (i, caps) in self.img_src.captures_iter(body).enumerate() {
            let original = caps[1].to_string();
            let decoded = self.decode_entities(&original);
            let Some(url) = resolve_media_url(&decoded, entry_link) else {
                debug!("Dropping image with unusable url: {:?}", original);
                continue;
            };
            let content_id = format!("img_{}_{}", i, short_uuid());
            candidates.push(MediaCandidate {
                kind: MediaKind::Image,
                content_id,
                original,
                url,
                link: None,
            });
        }
    }

    /// Replaces every iframe with either a video thumbnail wrapped in an
    /// outbound link, or a plain link back to the entry when the embed is
    /// not a recognized video platform.
    fn rewrite_iframes(
        &self,
        body: &str,
        entry_link: &str,
        candidates: &mut Vec<MediaCandidate>,
        seen_videos: &mut HashSet<String>,
    ) -> String {
        self.iframe
            .replace_all(body, |caps: &Captures| {
                let tag_text = &caps[0];
                let src = self
                    .iframe_src
                    .captures(tag_text)
                    .map(|c| self.decode_entities(&c[1]));

                if let Some(src) = src {
                    if let Some(video) = self.recognize_video(&src) {
                        if seen_videos.insert(video.content_id.clone()) {
                            candidates.push(MediaCandidate {
                                kind: MediaKind::VideoThumbnail,
                                content_id: video.content_id.clone(),
                                original: video.thumbnail.clone(),
                                url: video.thumbnail.clone(),
                                link: Some(src.clone()),
                            });
                        }
                        return format!(
                            r#"<a href="{src}" target="_blank"><img src="{thumb}" alt="Video thumbnail" style="max-width:100%;"></a><br><a href="{src}" target="_blank">Watch video</a>"#,
                            src = src,
                            thumb = video.thumbnail,
                        );
                    }
                }

                format!(
                    r#"<a href="{}" target="_blank">View embedded content</a>"#,
                    entry_link
                )
            })
            .to_string()
    }

    /// Finds recognized video URLs that were not embedded via iframes and
    /// appends a thumbnail block for each, so they still show up as a
    /// thumbnail plus outbound link.
    fn append_video_thumbnails(
        &self,
        html: String,
        candidates: &mut Vec<MediaCandidate>,
        seen_videos: &mut HashSet<String>,
    ) -> String {
        let mut html = html;
        let patterns = [
            &self.youtube_watch,
            &self.youtube_short,
            &self.youtube_embed,
            &self.vimeo,
        ];

        let mut blocks = Vec::new();
        for pattern in patterns {
            for caps in pattern.captures_iter(&html) {
                let matched = caps[0].to_string();
                let Some(video) = self.recognize_video(&matched) else {
                    continue;
                };
                if !seen_videos.insert(video.content_id.clone()) {
                    continue;
                }
                let link = if matched.starts_with("http") {
                    matched
                } else {
                    format!("https://{}", matched)
                };
                candidates.push(MediaCandidate {
                    kind: MediaKind::VideoThumbnail,
                    content_id: video.content_id,
                    original: video.thumbnail.clone(),
                    url: video.thumbnail.clone(),
                    link: Some(link.clone()),
                });
                blocks.push(format!(
                    r#"<p><a href="{link}" target="_blank"><img src="{thumb}" alt="Video thumbnail" style="max-width:100%;"></a><br><a href="{link}" target="_blank">Watch video</a></p>"#,
                    link = link,
                    thumb = video.thumbnail,
                ));
            }
        }

        for block in blocks {
            html.push_str(&block);
        }
        html
    }

    fn recognize_video(&self, url: &str) -> Option<VideoRef> {
        for re in [&self.youtube_embed, &self.youtube_watch, &self.youtube_short] {
            if let Some(caps) = re.captures(url) {
                let id = &caps[1];
                return Some(VideoRef {
                    content_id: format!("yt_{}", id),
                    thumbnail: format!("https://img.youtube.com/vi/{}/hqdefault.jpg", id),
                });
            }
        }
        if let Some(caps) = self.vimeo.captures(url) {
            let id = &caps[1];
            return Some(VideoRef {
                content_id: format!("vimeo_{}", id),
                thumbnail: format!("https://vumbnail.com/{}.jpg", id),
            });
        }
        None
    }
}

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Absolute http(s) URLs pass through, relative ones are joined against the
/// entry link. Anything else is unusable for embedding.
fn resolve_media_url(url: &str, base: &str) -> Option<String> {
    match Url::parse(url) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => Some(u.to_string()),
        Ok(_) => None,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = Url::parse(base).ok()?;
            base.join(url).ok().map(|u| u.to_string())
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn processor() -> ContentProcessor {
        ContentProcessor::new().unwrap()
    }

    fn make_entry(body: &str) -> Entry {
        Entry {
            id: "e1".to_string(),
            title: "Post".to_string(),
            link: "https://example.com/posts/1".to_string(),
            author: None,
            published: Utc::now(),
            body: body.to_string(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn ampersand_entities_decode_in_urls() {
        let p = processor();
        assert_eq!(
            p.decode_entities("https://example.com/img?a=1&amp;b=2"),
            "https://example.com/img?a=1&b=2"
        );
    }

    #[test]
    fn numeric_entities_decode() {
        let p = processor();
        assert_eq!(p.decode_entities("&#65;&#x42;&#x63;"), "ABc");
        assert_eq!(p.decode_entities("it&#39;s"), "it's");
    }

    #[test]
    fn unknown_entities_are_left_alone() {
        let p = processor();
        assert_eq!(p.decode_entities("&bogus; stays"), "&bogus; stays");
    }

    #[test]
    fn decoding_is_single_pass() {
        let p = processor();
        // &amp;lt; is an escaped "&lt;", not a "<".
        assert_eq!(p.decode_entities("&amp;lt;"), "&lt;");
    }

    #[test]
    fn absolute_image_becomes_candidate() {
        let p = processor();
        let entry = make_entry(r#"<p>hi</p><img src="https://cdn.example.com/a.png" alt="">"#);
        let out = p.process(&entry);

        assert_eq!(out.media.len(), 1);
        assert_eq!(out.media[0].kind, MediaKind::Image);
        assert_eq!(out.media[0].url, "https://cdn.example.com/a.png");
        assert_eq!(out.media[0].original, "https://cdn.example.com/a.png");
        assert!(out.media[0].content_id.starts_with("img_0_"));
    }

    #[test]
    fn entity_encoded_image_url_is_decoded_for_download() {
        let p = processor();
        let entry = make_entry(r#"<img src="https://cdn.example.com/i?a=1&amp;b=2">"#);
        let out = p.process(&entry);

        assert_eq!(out.media[0].url, "https://cdn.example.com/i?a=1&b=2");
        assert_eq!(out.media[0].original, "https://cdn.example.com/i?a=1&amp;b=2");
    }

    #[test]
    fn relative_image_resolves_against_entry_link() {
        let p = processor();
        let entry = make_entry(r#"<img src="/images/cover.jpg">"#);
        let out = p.process(&entry);

        assert_eq!(out.media[0].url, "https://example.com/images/cover.jpg");
    }

    #[test]
    fn protocol_relative_image_resolves() {
        let p = processor();
        let entry = make_entry(r#"<img src="//cdn.example.com/x.png">"#);
        let out = p.process(&entry);

        assert_eq!(out.media[0].url, "https://cdn.example.com/x.png");
    }

    #[test]
    fn unparseable_image_url_is_dropped() {
        let p = processor();
        let entry = make_entry(r#"<img src="http://[broken"><img src="data:image/png;base64,AAAA">"#);
        let out = p.process(&entry);

        assert!(out.media.is_empty(), "malformed and non-http urls must be dropped");
    }

    #[test]
    fn youtube_iframe_becomes_thumbnail_and_link() {
        let p = processor();
        let entry = make_entry(
            r#"<p>intro</p><iframe width="560" src="https://www.youtube.com/embed/dQw4w9WgXcQ" frameborder="0"></iframe>"#,
        );
        let out = p.process(&entry);

        assert_eq!(out.media.len(), 1);
        let media = &out.media[0];
        assert_eq!(media.kind, MediaKind::VideoThumbnail);
        assert_eq!(media.content_id, "yt_dQw4w9WgXcQ");
        assert_eq!(
            media.url,
            "https://img.youtube.com/vi/dQw4w9WgXcQ/hqdefault.jpg"
        );
        assert_eq!(
            media.link.as_deref(),
            Some("https://www.youtube.com/embed/dQw4w9WgXcQ")
        );

        assert!(!out.html.contains("<iframe"), "no iframe may survive");
        assert!(out.html.contains("https://www.youtube.com/embed/dQw4w9WgXcQ"));
        assert!(out.html.contains(&media.url));
    }

    #[test]
    fn multiline_iframe_is_rewritten() {
        let p = processor();
        let entry = make_entry(
            "<iframe\n  src=\"https://www.youtube.com/embed/abc123XYZ_-\"\n  allowfullscreen>\n</iframe>",
        );
        let out = p.process(&entry);

        assert!(!out.html.contains("<iframe"));
        assert_eq!(out.media.len(), 1);
        assert_eq!(out.media[0].content_id, "yt_abc123XYZ_-");
    }

    #[test]
    fn unrecognized_iframe_degrades_to_entry_link() {
        let p = processor();
        let entry = make_entry(r#"<iframe src="https://maps.example.com/embed?x=1"></iframe>"#);
        let out = p.process(&entry);

        assert!(out.media.is_empty());
        assert!(!out.html.contains("<iframe"));
        assert!(out.html.contains("https://example.com/posts/1"));
    }

    #[test]
    fn bare_watch_link_gets_appended_thumbnail() {
        let p = processor();
        let entry =
            make_entry(r#"<a href="https://www.youtube.com/watch?v=dQw4w9WgXcQ">trailer</a>"#);
        let out = p.process(&entry);

        assert_eq!(out.media.len(), 1);
        assert_eq!(out.media[0].content_id, "yt_dQw4w9WgXcQ");
        assert_eq!(
            out.media[0].link.as_deref(),
            Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
        );
        assert!(out
            .html
            .contains("https://img.youtube.com/vi/dQw4w9WgXcQ/hqdefault.jpg"));
    }

    #[test]
    fn iframe_and_bare_link_for_same_video_yield_one_candidate() {
        let p = processor();
        let entry = make_entry(
            r#"<iframe src="https://www.youtube.com/embed/dQw4w9WgXcQ"></iframe>
               <a href="https://youtu.be/dQw4w9WgXcQ">watch</a>"#,
        );
        let out = p.process(&entry);

        let video_count = out
            .media
            .iter()
            .filter(|m| m.kind == MediaKind::VideoThumbnail)
            .count();
        assert_eq!(video_count, 1);
    }

    #[test]
    fn vimeo_player_link_uses_vumbnail() {
        let p = processor();
        let entry = make_entry(r#"<iframe src="https://player.vimeo.com/video/76979871"></iframe>"#);
        let out = p.process(&entry);

        assert_eq!(out.media.len(), 1);
        assert_eq!(out.media[0].content_id, "vimeo_76979871");
        assert_eq!(out.media[0].url, "https://vumbnail.com/76979871.jpg");
    }

    #[test]
    fn text_rendition_strips_markup() {
        let p = processor();
        let body = "<p>first&nbsp;part</p><p>a &amp; b<br>next line</p>";
        assert_eq!(p.text_rendition(body), "first part\n\na & b\nnext line");
    }

    #[test]
    fn text_rendition_collapses_blank_runs() {
        let p = processor();
        let body = "<p>one</p>\n\n\n\n<p>two</p>";
        let text = p.text_rendition(body);
        assert!(!text.contains("\n\n\n"));
        assert!(text.contains("one"));
        assert!(text.contains("two"));
    }
}
