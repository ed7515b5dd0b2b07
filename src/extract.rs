//! Listing extraction. The host page's markup changes across versions, so
//! nothing here relies on a single layout: identifiers, titles and companies
//! are each resolved by trying several independent strategies in priority
//! order. Failure to extract yields `None`, never an error - the page may
//! simply still be loading.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::models::{CompanyRating, JobRecord};

const ID_ATTRIBUTES: &[&str] = &[
    "data-job-id",
    "data-occludable-job-id",
    "data-entity-urn",
    "data-id",
];

static LINK_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"/jobs/view/(\d+)",
        r"currentJobId=(\d+)",
        r"[?&]jk=([0-9a-f]+)",
        r"/job/([A-Za-z0-9_-]{6,})",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static CONTENT_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(data-job-id|data-occludable-job-id|jobPosting|/jobs/view/|currentJobId=|job[-_]card|job[-_]title|company[-_]name)"#,
    )
    .expect("static regex")
});

static RATING_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d(?:\.\d)?)\s*(?:★|\u{2605}|stars?|/\s*5)").expect("static regex"));

static REVIEW_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d,]+)\s+reviews?").expect("static regex"));

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

/// Listing container candidates, most specific first. Shared with the
/// WebDriver side so both scrape the same nodes.
pub const CONTAINER_CSS: &[&str] = &[
    "li[data-occludable-job-id]",
    "[data-job-id]",
    "li[class*='job-card']",
    "div[class*='job-card']",
    "li[class*='result']",
];

static CONTAINER_SELECTORS: LazyLock<Vec<Selector>> =
    LazyLock::new(|| CONTAINER_CSS.iter().map(|s| sel(s)).collect());

static TITLE_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "[data-job-title]",
        "a[class*='job-title']",
        "h3 a",
        "h3",
        "strong a",
        "[class*='title'] a",
        "[class*='title']",
    ]
    .iter()
    .map(|s| sel(s))
    .collect()
});

static COMPANY_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "[data-company-name]",
        "[class*='company-name']",
        "[class*='company']",
        "h4",
        "[class*='subtitle']",
    ]
    .iter()
    .map(|s| sel(s))
    .collect()
});

static LOCATION_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "[class*='location']",
        "[class*='metadata'] li",
        "[class*='caption']",
    ]
    .iter()
    .map(|s| sel(s))
    .collect()
});

static RATING_SELECTOR: LazyLock<Selector> = LazyLock::new(|| sel("[class*='rating']"));
static LINK_SELECTOR: LazyLock<Selector> = LazyLock::new(|| sel("a[href]"));

/// Extracts a job record from one listing container's HTML. Returns `None`
/// when no strategy yields a non-empty identifier; callers treat that as
/// "not yet extractable", not as an error.
pub fn extract_listing(html: &str) -> Option<JobRecord> {
    let fragment = Html::parse_fragment(html);
    let root = fragment.root_element();

    let title = first_text(root, &TITLE_SELECTORS);
    let company = first_text(root, &COMPANY_SELECTORS);
    let location = first_text(root, &LOCATION_SELECTORS);

    let job_id = extract_id(root, &title, &company)?;
    let rating = parse_rating_in(root).unwrap_or_else(CompanyRating::invalid);

    Some(JobRecord {
        job_id,
        title,
        company,
        location,
        rating,
    })
}

/// Extracts every listing from a full page snapshot, deduplicated by id in
/// document order.
pub fn extract_listings(page_html: &str) -> Vec<JobRecord> {
    let doc = Html::parse_document(page_html);
    let mut seen = std::collections::HashSet::new();
    let mut records = Vec::new();

    for selector in CONTAINER_SELECTORS.iter() {
        for element in doc.select(selector) {
            if let Some(record) = extract_listing(&element.html()) {
                if seen.insert(record.job_id.clone()) {
                    records.push(record);
                }
            }
        }
    }
    records
}

/// Cheap pre-filter used by the page observer: does this added markup look
/// like job content at all? Keeps irrelevant mutations (animation class
/// toggles and the like) from triggering a full rescan.
pub fn looks_like_job_content(html: &str) -> bool {
    CONTENT_HINT.is_match(html)
}

/// Parses a rating widget out of a fragment of markup, if one is present.
pub fn parse_rating(html: &str) -> Option<CompanyRating> {
    let fragment = Html::parse_fragment(html);
    parse_rating_in(fragment.root_element())
}

fn parse_rating_in(root: ElementRef<'_>) -> Option<CompanyRating> {
    let text = match root.select(&RATING_SELECTOR).next() {
        Some(widget) => widget.text().collect::<String>(),
        None => root.text().collect::<String>(),
    };

    let rating: f64 = RATING_VALUE.captures(&text)?.get(1)?.as_str().parse().ok()?;
    let review_count = REVIEW_COUNT
        .captures(&text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().replace(',', "").parse().ok())
        .unwrap_or(0);

    Some(CompanyRating {
        rating,
        review_count,
        is_valid: true,
    })
}

fn extract_id(root: ElementRef<'_>, title: &str, company: &str) -> Option<String> {
    // Strategy 1: explicit identifier attributes, on the container itself or
    // any descendant.
    if let Some(id) = id_from_attributes(root) {
        return Some(id);
    }

    // Strategy 2: embedded links whose href encodes an identifier.
    for link in root.select(&LINK_SELECTOR) {
        if let Some(href) = link.value().attr("href") {
            for pattern in LINK_ID_PATTERNS.iter() {
                if let Some(caps) = pattern.captures(href) {
                    if let Some(m) = caps.get(1) {
                        if !m.as_str().is_empty() {
                            return Some(m.as_str().to_string());
                        }
                    }
                }
            }
        }
    }

    // Strategy 3: content-derived fallback hash.
    if !title.is_empty() && !company.is_empty() {
        return Some(content_hash_id(title, company));
    }

    None
}

fn id_from_attributes(root: ElementRef<'_>) -> Option<String> {
    let candidates = std::iter::once(root).chain(root.descendants().filter_map(ElementRef::wrap));
    for element in candidates {
        for attr in ID_ATTRIBUTES {
            if let Some(value) = element.value().attr(attr) {
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                // urn:li:jobPosting:123 style values carry the id last.
                let id = value.rsplit(':').next().unwrap_or(value);
                if !id.is_empty() {
                    return Some(id.to_string());
                }
            }
        }
    }
    None
}

/// Stable synthesized identifier for listings that expose no id of their own.
pub fn content_hash_id(title: &str, company: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(company.trim().to_lowercase().as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{:02x}", byte));
    }
    format!("cs-{}", hex)
}

fn first_text(root: ElementRef<'_>, selectors: &[Selector]) -> String {
    for selector in selectors {
        if let Some(element) = root.select(selector).next() {
            let text = element.text().collect::<String>();
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !text.is_empty() {
                return text;
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATTR_LISTING: &str = r#"
        <li data-occludable-job-id="4021337">
          <a class="job-title-link" href="/jobs/view/9999999">Senior Rust Engineer</a>
          <span class="company-name">Acme Corp</span>
          <span class="job-location">Berlin, Germany</span>
        </li>"#;

    const LINK_LISTING: &str = r#"
        <div class="job-card">
          <h3><a href="https://example.com/jobs/view/555123?ref=x">Backend Developer</a></h3>
          <h4>Globex</h4>
          <span class="location">Remote</span>
        </div>"#;

    const BARE_LISTING: &str = r#"
        <div class="job-card">
          <h3>Platform Engineer</h3>
          <h4>Initech</h4>
        </div>"#;

    #[test]
    fn test_id_attribute_takes_priority_over_link() {
        let record = extract_listing(ATTR_LISTING).unwrap();
        assert_eq!(record.job_id, "4021337");
        assert_eq!(record.title, "Senior Rust Engineer");
        assert_eq!(record.company, "Acme Corp");
        assert_eq!(record.location, "Berlin, Germany");
    }

    #[test]
    fn test_id_from_link_href() {
        let record = extract_listing(LINK_LISTING).unwrap();
        assert_eq!(record.job_id, "555123");
        assert_eq!(record.company, "Globex");
    }

    #[test]
    fn test_id_from_entity_urn() {
        let html = r#"<li data-entity-urn="urn:li:jobPosting:777"><h3>Dev</h3><h4>X Co</h4></li>"#;
        let record = extract_listing(html).unwrap();
        assert_eq!(record.job_id, "777");
    }

    #[test]
    fn test_content_hash_fallback_is_stable() {
        let a = extract_listing(BARE_LISTING).unwrap();
        let b = extract_listing(BARE_LISTING).unwrap();
        assert_eq!(a.job_id, b.job_id);
        assert!(a.job_id.starts_with("cs-"));
        assert_eq!(
            a.job_id,
            content_hash_id("Platform Engineer", "Initech")
        );
        // Hash ignores case and padding.
        assert_eq!(
            content_hash_id("  platform engineer ", "INITECH"),
            a.job_id
        );
    }

    #[test]
    fn test_unextractable_listing_yields_none() {
        assert!(extract_listing("<div><p>Loading...</p></div>").is_none());
        assert!(extract_listing("<div class='job-card'><h3>Title only</h3></div>").is_none());
    }

    #[test]
    fn test_rating_parse_with_reviews() {
        let html = r#"<span class="company-rating">4.2 ★ (1,234 reviews)</span>"#;
        let rating = parse_rating(html).unwrap();
        assert!(rating.is_valid);
        assert_eq!(rating.rating, 4.2);
        assert_eq!(rating.review_count, 1234);
    }

    #[test]
    fn test_rating_absent_yields_none() {
        assert!(parse_rating("<span class='company-name'>Acme</span>").is_none());
    }

    #[test]
    fn test_listing_without_rating_gets_invalid_sentinel() {
        let record = extract_listing(LINK_LISTING).unwrap();
        assert!(!record.rating.is_valid);
    }

    #[test]
    fn test_looks_like_job_content() {
        assert!(looks_like_job_content(ATTR_LISTING));
        assert!(looks_like_job_content(LINK_LISTING));
        assert!(!looks_like_job_content(
            "<div class='spinner animate-pulse'></div>"
        ));
        assert!(!looks_like_job_content("<footer>About us</footer>"));
    }

    #[test]
    fn test_extract_listings_dedupes_by_id() {
        let page = format!(
            "<html><body><ul>{}{}{}</ul></body></html>",
            ATTR_LISTING, ATTR_LISTING, LINK_LISTING
        );
        let records = extract_listings(&page);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].job_id, "4021337");
        assert_eq!(records[1].job_id, "555123");
    }
}
