use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

use crate::config::{ColumnKind, RecordSchema};
use crate::era;
use crate::error::ParseError;
use crate::resource::{FieldValue, RawPayload, Record};

lazy_static! {
    static ref QUOTED_ARG: Regex = Regex::new(r"'([^']+)'").unwrap();
    static ref ROW: Selector = Selector::parse("tr").unwrap();
    static ref HEADER_CELL: Selector = Selector::parse("th").unwrap();
    static ref DATA_CELL: Selector = Selector::parse("td").unwrap();
    static ref ANCHOR: Selector = Selector::parse("a").unwrap();
}

/// A malformed entry skipped inside an otherwise usable payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryWarning {
    /// 1-based index among data rows
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBatch {
    pub records: Vec<Record>,
    pub warnings: Vec<EntryWarning>,
}

/// Extracts records from the data table of a resource page.
#[derive(Debug, Clone)]
pub struct RecordParser {
    schema: RecordSchema,
}

impl RecordParser {
    pub fn new(schema: RecordSchema) -> Result<Self, ParseError> {
        Selector::parse(&schema.table_selector).map_err(|e| {
            ParseError::new(format!("invalid selector: {e:?}"), &schema.table_selector)
        })?;
        Ok(Self { schema })
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    /// Pure function of the payload: `parsed_at` is the payload's fetch time.
    pub fn parse(&self, payload: &RawPayload) -> Result<ParsedBatch, ParseError> {
        let text = std::str::from_utf8(&payload.bytes).map_err(|e| {
            ParseError::new("payload is not valid UTF-8", format!("byte {}", e.valid_up_to()))
        })?;
        let base = Url::parse(&payload.source_url).ok();

        let document = Html::parse_document(text);
        let table_sel = Selector::parse(&self.schema.table_selector).map_err(|e| {
            ParseError::new(format!("invalid selector: {e:?}"), &self.schema.table_selector)
        })?;
        let table = document.select(&table_sel).next().ok_or_else(|| {
            ParseError::new("no table matches", &self.schema.table_selector)
        })?;

        let headers: Vec<String> = table
            .select(&ROW)
            .find(|row| row.select(&HEADER_CELL).next().is_some())
            .map(|row| row.select(&HEADER_CELL).map(|th| text_of(&th)).collect())
            .ok_or_else(|| {
                ParseError::new("table has no header row", &self.schema.table_selector)
            })?;

        let mut batch = ParsedBatch::default();
        let data_rows = table
            .select(&ROW)
            .filter(|row| row.select(&HEADER_CELL).next().is_none())
            .filter(|row| row.select(&DATA_CELL).next().is_some());

        for (i, row) in data_rows.enumerate() {
            match self.parse_row(&headers, row, base.as_ref()) {
                Ok((record_id, fields)) => batch.records.push(Record {
                    record_id,
                    fields,
                    source_content_hash: payload.content_hash,
                    parsed_at: payload.fetched_at,
                }),
                Err(reason) => batch.warnings.push(EntryWarning { row: i + 1, reason }),
            }
        }

        Ok(batch)
    }

    fn parse_row(
        &self,
        headers: &[String],
        row: ElementRef,
        base: Option<&Url>,
    ) -> Result<(String, BTreeMap<String, FieldValue>), String> {
        let cells: Vec<String> = row.select(&DATA_CELL).map(|td| text_of(&td)).collect();

        let mut fields = BTreeMap::new();
        for (header, cell) in headers.iter().zip(cells.iter()) {
            if header.is_empty() || self.schema.ignore_columns.contains(header) {
                continue;
            }
            let kind = self.schema.column(header).map(|c| c.kind).unwrap_or_default();
            let value = match typed(kind, cell) {
                Ok(value) => value,
                Err(reason) if self.is_required(header) => {
                    return Err(format!("column {header}: {reason}"))
                }
                Err(reason) => {
                    log::debug!("Column {header} left missing: {reason}");
                    FieldValue::Missing
                }
            };
            fields.insert(header.clone(), value);
        }

        for column in self.schema.columns.iter().filter(|c| c.required) {
            if fields.get(&column.name).map_or(true, FieldValue::is_missing) {
                return Err(format!("missing required column {}", column.name));
            }
        }

        if let Some(link_field) = &self.schema.link_field {
            if let Some(link) = row_link(row, base) {
                fields.insert(link_field.clone(), FieldValue::Text(link));
            }
        }

        let mut parts = Vec::with_capacity(self.schema.id_columns.len());
        for column in &self.schema.id_columns {
            match fields.get(column) {
                Some(value) if !value.is_missing() => parts.push(value.to_string()),
                _ => return Err(format!("empty id column {column}")),
            }
        }

        Ok((parts.join("/"), fields))
    }

    fn is_required(&self, header: &str) -> bool {
        self.schema.column(header).map(|c| c.required).unwrap_or(false)
    }
}

fn text_of(el: &ElementRef) -> String {
    el.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn typed(kind: ColumnKind, raw: &str) -> Result<FieldValue, String> {
    if raw.is_empty() {
        return Ok(FieldValue::Missing);
    }
    match kind {
        ColumnKind::Text => Ok(FieldValue::Text(raw.to_string())),
        ColumnKind::Number => {
            let cleaned: String = era::normalize(raw).chars().filter(|c| *c != ',').collect();
            cleaned
                .trim()
                .parse::<f64>()
                .map(FieldValue::Number)
                .map_err(|_| format!("{raw:?} is not a number"))
        }
        ColumnKind::Timestamp => parse_timestamp(raw)
            .map(FieldValue::Timestamp)
            .ok_or_else(|| format!("{raw:?} is not a date")),
        ColumnKind::Year => era::parse_year(raw)
            .map(|y| FieldValue::Number(y as f64))
            .ok_or_else(|| format!("{raw:?} is not a year")),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = era::normalize(raw);
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d", "%Y/%m/%d", "%Y年%m月%d日"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// First usable link of a row. The portal's download buttons carry
/// `href="#"` and pass the file path as the third argument of `onclick`.
fn row_link(row: ElementRef, base: Option<&Url>) -> Option<String> {
    let anchor = row.select(&ANCHOR).next()?;
    let href = anchor
        .value()
        .attr("href")
        .map(str::trim)
        .filter(|h| !h.is_empty() && !h.starts_with('#') && !h.starts_with("javascript:"));
    let target = match href {
        Some(href) => href.to_string(),
        None => {
            let onclick = anchor.value().attr("onclick")?;
            QUOTED_ARG.captures_iter(onclick).nth(2)?[1].to_string()
        }
    };
    match base.map(|b| b.join(&target)) {
        Some(Ok(url)) => Some(url.to_string()),
        _ => Some(target),
    }
}
