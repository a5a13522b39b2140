//! SPIMEX source adapters: the bulletin listing crawler and the spreadsheet parser.

use std::collections::HashSet;

use chrono::NaiveDate;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use spimex_core::{BulletinLink, DateRange};
use spimex_storage::ResourceFetcher;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub mod sheet;

pub use sheet::{parse_bulletin, parse_grid, SheetCell, SheetError, SheetGrid};

pub const LISTING_URL: &str = "https://spimex.com/markets/oil_products/trades/results/";
pub const SITE_ORIGIN: &str = "https://spimex.com";
pub const DEFAULT_MAX_PAGES: usize = 388;

const LINK_SELECTOR: &str = "a.accordeon-inner__item-title.link.xls";
const NEXT_PAGE_SELECTOR: &str = "div.bx-pagination-container li.bx-pag-next a";
const BULLETIN_PATH_MARKER: &str = "/upload/reports/oil_xls/oil_xls_";
const BULLETIN_EXTENSION: &str = ".xls";
const DATE_MARKER: &str = "oil_xls_";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: &'static str, message: String },
}

/// Where and how far the locator crawls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    pub listing_url: String,
    pub site_origin: String,
    pub max_pages: usize,
    /// Pages older than this (with nothing in range) end the crawl.
    pub history_cutoff: NaiveDate,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            listing_url: LISTING_URL.to_string(),
            site_origin: SITE_ORIGIN.to_string(),
            max_pages: DEFAULT_MAX_PAGES,
            history_cutoff: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or(NaiveDate::MIN),
        }
    }
}

/// One bulletin anchor from a listing page, query string already removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub href: String,
    /// `None` when the embedded date is malformed.
    pub trade_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub entries: Vec<ListingEntry>,
    pub has_next_page: bool,
}

fn selector(raw: &'static str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Selector {
        selector: raw,
        message: e.to_string(),
    })
}

fn is_bulletin_href(href: &str) -> bool {
    href.contains(BULLETIN_PATH_MARKER) && href.ends_with(BULLETIN_EXTENSION)
}

/// Reads the `YYYYMMDD` stamp that follows `oil_xls_` in a bulletin href.
pub fn trade_date_from_href(href: &str) -> Option<NaiveDate> {
    let start = href.find(DATE_MARKER)? + DATE_MARKER.len();
    let stamp: String = href[start..].chars().take(8).collect();
    if stamp.len() != 8 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = stamp[0..4].parse().ok()?;
    let month = stamp[4..6].parse().ok()?;
    let day = stamp[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Extracts bulletin entries and the pagination state from one listing page.
pub fn parse_listing_page(html: &str) -> Result<ListingPage, AdapterError> {
    let document = Html::parse_document(html);
    let link_sel = selector(LINK_SELECTOR)?;
    let next_sel = selector(NEXT_PAGE_SELECTOR)?;

    let mut entries = Vec::new();
    for anchor in document.select(&link_sel) {
        let Some(raw_href) = anchor.value().attr("href") else {
            debug!("skipping anchor without href");
            continue;
        };
        let href = raw_href.split('?').next().unwrap_or_default().trim();
        if !is_bulletin_href(href) {
            debug!(href, "skipping href outside the oil_xls pattern");
            continue;
        }
        let trade_date = trade_date_from_href(href);
        if trade_date.is_none() {
            warn!(href, "could not read trade date from bulletin link");
        }
        entries.push(ListingEntry {
            href: href.to_string(),
            trade_date,
        });
    }

    Ok(ListingPage {
        entries,
        has_next_page: document.select(&next_sel).next().is_some(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    CutoffReached,
    NoNextPage,
    MaxPages,
    FetchFailed(String),
    PageUnreadable(String),
}

#[derive(Debug, Clone)]
pub struct LocateOutcome {
    pub links: Vec<BulletinLink>,
    pub pages_read: usize,
    pub stop: StopReason,
}

/// Crawls the paginated results listing and collects bulletins inside a date range.
pub struct BulletinLocator<'a> {
    fetcher: &'a dyn ResourceFetcher,
    config: ListingConfig,
}

impl<'a> BulletinLocator<'a> {
    pub fn new(fetcher: &'a dyn ResourceFetcher, config: ListingConfig) -> Self {
        Self { fetcher, config }
    }

    pub fn page_url(&self, page: usize) -> String {
        if page <= 1 {
            self.config.listing_url.clone()
        } else {
            format!("{}?page=page-{page}", self.config.listing_url)
        }
    }

    pub fn absolute_url(&self, href: &str) -> String {
        if href.starts_with("http") {
            href.to_string()
        } else {
            format!("{}{}", self.config.site_origin.trim_end_matches('/'), href)
        }
    }

    /// Never fails: a page that cannot be fetched ends the crawl with what was found so far.
    pub async fn locate(&self, range: DateRange) -> LocateOutcome {
        let cutoff = self.config.history_cutoff.min(range.start());
        let mut seen = HashSet::new();
        let mut links = Vec::new();
        let mut pages_read = 0usize;
        let mut page = 1usize;

        let stop = loop {
            if page > self.config.max_pages {
                info!(max_pages = self.config.max_pages, "page limit reached");
                break StopReason::MaxPages;
            }

            let url = self.page_url(page);
            info!(page, %url, "reading listing page");
            let body = match self.fetcher.fetch_bytes(&url).await {
                Ok(resp) => resp.text(),
                Err(err) => {
                    error!(page, %url, error = %err, "listing page fetch failed");
                    break StopReason::FetchFailed(err.to_string());
                }
            };
            let listing = match parse_listing_page(&body) {
                Ok(listing) => listing,
                Err(err) => {
                    error!(page, error = %err, "listing page could not be parsed");
                    break StopReason::PageUnreadable(err.to_string());
                }
            };
            pages_read += 1;
            info!(page, entries = listing.entries.len(), "listing page parsed");

            let mut found_in_range = false;
            let mut earliest: Option<NaiveDate> = None;
            for entry in &listing.entries {
                let Some(date) = entry.trade_date else {
                    continue;
                };
                earliest = Some(earliest.map_or(date, |e| e.min(date)));
                if !range.contains(date) {
                    debug!(href = %entry.href, %date, "bulletin outside date range");
                    continue;
                }
                found_in_range = true;
                let url = self.absolute_url(&entry.href);
                if seen.insert(url.clone()) {
                    links.push(BulletinLink {
                        url,
                        trade_date: date,
                    });
                }
            }

            if !found_in_range && earliest.is_some_and(|d| d < cutoff) {
                info!(page, %cutoff, "listing reached dates before the cutoff");
                break StopReason::CutoffReached;
            }
            if !listing.has_next_page {
                info!(page, "no next page in pagination");
                break StopReason::NoNextPage;
            }
            page += 1;
        };

        info!(bulletins = links.len(), pages_read, ?stop, "bulletin discovery finished");
        LocateOutcome {
            links,
            pages_read,
            stop,
        }
    }
}
