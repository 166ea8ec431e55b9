use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};

use dedup_storage::{DedupError, FileFilter, FileId, PageRequest, SortKey, SortSpec};

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Decoded `key=value` pairs of a request query string.
#[derive(Debug, Default)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn parse(query: Option<&str>) -> Self {
        let pairs = query
            .unwrap_or("")
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| {
                let (key, value) = p.split_once('=').unwrap_or((p, ""));
                (decode(key), decode(value))
            })
            .collect();
        Self { pairs }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str, DedupError> {
        self.get(key)
            .ok_or_else(|| DedupError::InvalidInput(format!("missing query parameter '{key}'")))
    }

    pub fn parse_opt<T>(&self, key: &str) -> Result<Option<T>, DedupError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse().map_err(|e| {
                    DedupError::InvalidInput(format!("query parameter '{key}': {e}"))
                })
            })
            .transpose()
    }

    pub fn flag(&self, key: &str) -> Result<Option<bool>, DedupError> {
        match self.get(key) {
            None => Ok(None),
            Some("1" | "true" | "yes") => Ok(Some(true)),
            Some("0" | "false" | "no") => Ok(Some(false)),
            Some(other) => Err(DedupError::InvalidInput(format!(
                "query parameter '{key}' must be a boolean, got '{other}'"
            ))),
        }
    }

    pub fn file_filter(&self) -> Result<FileFilter, DedupError> {
        Ok(FileFilter {
            owner: self.get("owner").map(str::to_string),
            name_contains: self.get("name").map(str::to_string),
            mime_type_prefix: self.get("mime").map(str::to_string),
            min_size: self.parse_opt("min_size")?,
            max_size: self.parse_opt("max_size")?,
            uploaded_after: self.get("after").map(|raw| parse_date(raw, false)).transpose()?,
            uploaded_before: self.get("before").map(|raw| parse_date(raw, true)).transpose()?,
            uploader_contains: self.get("uploader").map(str::to_string),
        })
    }

    pub fn page_request(&self) -> Result<PageRequest, DedupError> {
        let limit = self
            .parse_opt::<usize>("limit")?
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .min(MAX_PAGE_SIZE);
        let start_after = self.parse_opt::<FileId>("token")?;
        let descending = match self.get("order") {
            None | Some("asc") => false,
            Some("desc") => true,
            Some(other) => {
                return Err(DedupError::InvalidInput(format!(
                    "order must be 'asc' or 'desc', got '{other}'"
                )))
            }
        };
        let sort = self
            .parse_opt::<SortKey>("sort")?
            .map(|key| SortSpec { key, descending });

        Ok(PageRequest {
            start_after,
            limit: Some(limit),
            sort,
        })
    }
}

fn decode(raw: &str) -> String {
    let raw = raw.replace('+', " ");
    urlencoding::decode(&raw)
        .map(|s| s.into_owned())
        .unwrap_or(raw)
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates. A plain date used
/// as an upper bound covers the whole day.
fn parse_date(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>, DedupError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| DedupError::InvalidInput(format!("date '{raw}': {e}")))?;
    let bound = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    bound
        .map(|naive| naive.and_utc())
        .ok_or_else(|| DedupError::InvalidInput(format!("date '{raw}' is out of range")))
}
