//! Server-rendered admin pages. Every dynamic value passes through
//! `html_escape` except review bodies, which go back through the allow-list
//! sanitizer so rows written by older builds render safely too.

use std::fmt::Write;

use chrono::{DateTime, Utc};
use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};

use crate::commands::{FETCH_REVIEWS_ACTION, LOOKUP_PLACE_ACTION};
use crate::media::MediaAsset;
use crate::sanitize;
use crate::reviews::{ReviewRecord, ReviewSummary};
use crate::settings::{PublicSettings, MAX_UPDATE_FREQUENCY_DAYS, MIN_UPDATE_FREQUENCY_DAYS};

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

pub struct SettingsView<'a> {
    pub settings: &'a PublicSettings,
    pub next_run: Option<DateTime<Utc>>,
    pub save_nonce: String,
    pub fetch_nonce: String,
    pub lookup_nonce: String,
    pub notice: Option<&'a str>,
}

pub fn settings_page(view: &SettingsView<'_>) -> String {
    let settings = view.settings;
    let mut body = String::new();

    if let Some(notice) = view.notice {
        let _ = write!(body, r#"<div class="notice">{}</div>"#, text(notice));
    }

    let key_hint = if settings.has_api_key {
        "A key is stored. Leave blank to keep it."
    } else {
        "No key stored yet."
    };
    let place_name = settings
        .cached_place_name
        .as_deref()
        .map(|name| format!("Current place: {}", text(name)))
        .unwrap_or_default();
    let next_run = view
        .next_run
        .map(|at| at.format(DATE_FORMAT).to_string())
        .unwrap_or_else(|| "Not scheduled".to_string());
    let last_fetch = settings
        .last_fetch_at
        .map(|at| at.format(DATE_FORMAT).to_string())
        .unwrap_or_else(|| "Never".to_string());

    let _ = write!(
        body,
        r#"<form method="post" action="/admin/settings">
<input type="hidden" name="nonce" value="{save_nonce}">
<table class="form-table">
<tr><th><label for="api_key">API Key</label></th>
<td><input type="password" id="api_key" name="api_key" value="" autocomplete="off"><p class="description">{key_hint}</p></td></tr>
<tr><th><label for="place_id">Place ID</label></th>
<td><input type="text" id="place_id" name="place_id" value="{place_id}">
<button type="button" id="lookup-place" data-action="{lookup_action}" data-nonce="{lookup_nonce}">Lookup Place</button>
<p class="description" id="place-name">{place_name}</p></td></tr>
<tr><th><label for="update_frequency_days">Update Frequency (days)</label></th>
<td><input type="number" id="update_frequency_days" name="update_frequency_days" min="{min}" max="{max}" value="{frequency}">
<p class="description">Next automatic update: {next_run}</p></td></tr>
</table>
<p><button type="submit">Save Settings</button></p>
</form>
<p>Last fetch: {last_fetch}</p>
<p><button type="button" id="fetch-reviews" data-action="{fetch_action}" data-nonce="{fetch_nonce}">Fetch Reviews Now</button></p>
<div id="fetch-result"></div>"#,
        save_nonce = attr(&view.save_nonce),
        key_hint = key_hint,
        place_id = attr(&settings.place_id),
        lookup_action = LOOKUP_PLACE_ACTION,
        lookup_nonce = attr(&view.lookup_nonce),
        place_name = place_name,
        min = MIN_UPDATE_FREQUENCY_DAYS,
        max = MAX_UPDATE_FREQUENCY_DAYS,
        frequency = settings.update_frequency_days,
        next_run = text(&next_run),
        last_fetch = text(&last_fetch),
        fetch_action = FETCH_REVIEWS_ACTION,
        fetch_nonce = attr(&view.fetch_nonce),
    );

    layout("Google Reviews Settings", &body)
}

pub fn reviews_page(reviews: &[ReviewSummary], total: i64) -> String {
    let mut body = format!("<p>{total} imported reviews</p>");
    if reviews.is_empty() {
        body.push_str("<p>No reviews imported yet.</p>");
        return layout("Google Reviews", &body);
    }

    body.push_str("<table class=\"reviews\"><thead><tr><th>Author</th><th>Rating</th><th>Date</th><th>Photo</th></tr></thead><tbody>");
    for review in reviews {
        let _ = write!(
            body,
            r#"<tr><td><a href="/admin/reviews/{id}">{title}</a></td><td>{stars}</td><td>{date}</td><td>{photo}</td></tr>"#,
            id = review.id,
            title = text(&review.title),
            stars = text(&review.rating_stars),
            date = text(&review.created_at),
            photo = if review.featured_media_id.is_some() { "yes" } else { "no" },
        );
    }
    body.push_str("</tbody></table>");
    layout("Google Reviews", &body)
}

/// Read-only details panel for one imported review.
pub fn review_details(review: &ReviewRecord, photo: Option<&MediaAsset>) -> String {
    let mut body = String::new();

    if let Some(asset) = photo {
        let _ = write!(
            body,
            r#"<p><img class="review-photo" src="{}" alt="{}" width="96"></p>"#,
            attr(&asset.public_path()),
            attr(review.meta_value("author_name")),
        );
    }

    let author = review.meta_value("author_name");
    let author_url = review.meta_value("author_url");
    let author_cell = if author_url.is_empty() {
        text(author).to_string()
    } else {
        format!(
            r#"<a href="{}" rel="noopener noreferrer" target="_blank">{}</a>"#,
            attr(author_url),
            text(author)
        )
    };

    let _ = write!(
        body,
        r#"<table class="review-meta">
<tr><th>Author</th><td>{author}</td></tr>
<tr><th>Rating</th><td><span class="stars">{stars}</span> ({rating}/5)</td></tr>
<tr><th>Review date</th><td>{date}</td></tr>
<tr><th>Posted</th><td>{relative}</td></tr>
<tr><th>Language</th><td>{language}</td></tr>
<tr><th>Review ID</th><td><code>{hash}</code></td></tr>
<tr><th>Imported</th><td>{imported}</td></tr>
</table>
<div class="review-body">{review_body}</div>
<p><a href="/admin/reviews">Back to reviews</a></p>"#,
        author = author_cell,
        stars = text(review.meta_value("rating_stars")),
        rating = text(review.meta_value("rating")),
        date = text(review.meta_value("review_date")),
        relative = text(review.meta_value("relative_time")),
        language = text(review.meta_value("language")),
        hash = text(review.meta_value("review_id")),
        imported = text(&review.imported_at),
        review_body = sanitize::rich_text(&review.body),
    );

    layout(&format!("Review by {author}"), &body)
}

pub fn error_page(title: &str, message: &str) -> String {
    layout(title, &format!(r#"<div class="notice notice-error">{}</div>"#, text(message)))
}

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>{title}</title></head>
<body>
<nav><a href="/admin">Settings</a> | <a href="/admin/reviews">Reviews</a></nav>
<h1>{title}</h1>
{body}
<script src="/admin/assets/admin.js"></script>
</body>
</html>
"#,
        title = text(title),
        body = body,
    )
}
