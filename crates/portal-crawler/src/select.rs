//! Narrowing stored records down to the ones worth downloading.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resource::{FieldValue, Record};

/// Keeps records whose `field` ends with the earliest matching suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preference {
    pub field: String,
    /// Most preferred first, compared case-insensitively
    pub suffixes: Vec<String>,
}

/// Region-aware narrowing on the values of `field`.
///
/// Records whose value ends with a `fallbackSuffixes` entry only survive when
/// nothing else is left. If any record covers the `whole` portal only those
/// are kept. Otherwise, inside each of `areas`, a record for the area itself
/// replaces the records of the narrower values the area lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coverage {
    pub field: String,
    #[serde(default)]
    pub whole: Vec<String>,
    #[serde(default)]
    pub fallback_suffixes: Vec<String>,
    #[serde(default)]
    pub areas: BTreeMap<String, Vec<String>>,
}

impl Coverage {
    fn value(&self, record: &Record) -> String {
        record
            .field(&self.field)
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    /// Also returns whether a whole-portal record was found.
    fn narrow(&self, group: Vec<Record>) -> (Vec<Record>, bool) {
        let (fallback, rest): (Vec<_>, Vec<_>) = group.into_iter().partition(|r| {
            let value = self.value(r);
            self.fallback_suffixes
                .iter()
                .any(|s| value.ends_with(s.as_str()))
        });
        let group = if rest.is_empty() { fallback } else { rest };

        let (whole, rest): (Vec<_>, Vec<_>) = group
            .into_iter()
            .partition(|r| self.whole.contains(&self.value(r)));
        if whole.is_empty() {
            (rest, false)
        } else {
            (whole, true)
        }
    }

    fn area_of(&self, value: &str) -> Option<&str> {
        self.areas
            .iter()
            .find(|(area, members)| *area == value || members.iter().any(|m| m == value))
            .map(|(area, _)| area.as_str())
    }

    fn organize(&self, group: Vec<Record>) -> Vec<Record> {
        let mut areas: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        let mut out = Vec::new();
        for record in group {
            match self.area_of(&self.value(&record)).map(str::to_string) {
                Some(area) => areas.entry(area).or_default().push(record),
                None => out.push(record),
            }
        }
        for (area, members) in areas {
            let (own, narrower): (Vec<_>, Vec<_>) =
                members.into_iter().partition(|r| self.value(r) == area);
            out.extend(if own.is_empty() { narrower } else { own });
        }
        out
    }
}

/// Per-group reduction of a record set.
///
/// Records are grouped by the values of `group_by` (by source payload when
/// empty). Within a group only the records holding the greatest `latest_by`
/// value survive, unless some record lacks that value: the group is then
/// kept for every value. Each surviving value is narrowed by `coverage`
/// then `prefer`. A group where no record matches any preferred suffix is
/// kept whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reduction {
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub latest_by: Option<String>,
    #[serde(default)]
    pub prefer: Option<Preference>,
    #[serde(default)]
    pub coverage: Option<Coverage>,
}

impl Reduction {
    pub fn is_noop(&self) -> bool {
        self.latest_by.is_none() && self.prefer.is_none() && self.coverage.is_none()
    }

    /// Output is ordered by group key, then by record id.
    pub fn apply(&self, records: impl IntoIterator<Item = Record>) -> Vec<Record> {
        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for record in records {
            groups.entry(self.key_of(&record)).or_default().push(record);
        }

        let mut out = Vec::new();
        for (key, group) in groups {
            let mut kept = Vec::new();
            for mut part in self.latest(&key, group) {
                let mut whole = false;
                if let Some(coverage) = &self.coverage {
                    (part, whole) = coverage.narrow(part);
                }
                if let Some(prefer) = &self.prefer {
                    part = preferred(part, prefer);
                }
                if let Some(coverage) = self.coverage.as_ref().filter(|_| !whole) {
                    part = coverage.organize(part);
                }
                kept.extend(part);
            }
            log::debug!("Group {key:?} reduced to {} records", kept.len());
            kept.sort_by(|a, b| a.record_id.cmp(&b.record_id));
            out.extend(kept);
        }
        out
    }

    fn key_of(&self, record: &Record) -> String {
        if self.group_by.is_empty() {
            return record.source_content_hash.to_hex();
        }
        self.group_by
            .iter()
            .map(|f| record.field(f).map(|v| v.to_string()).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }

    /// Splits `group` by its `latest_by` values and keeps the greatest one.
    fn latest(&self, key: &str, group: Vec<Record>) -> Vec<Vec<Record>> {
        let Some(field) = &self.latest_by else {
            return vec![group];
        };

        let mut by_value: Vec<(FieldValue, Vec<Record>)> = Vec::new();
        for record in group {
            let value = record.field(field).cloned().unwrap_or(FieldValue::Missing);
            match by_value
                .iter_mut()
                .find(|(v, _)| compare(v, &value) == Ordering::Equal)
            {
                Some((_, records)) => records.push(record),
                None => by_value.push((value, vec![record])),
            }
        }

        if by_value.iter().any(|(v, _)| matches!(v, FieldValue::Missing)) {
            log::warn!("Group {key:?} has records without {field}, keeping every {field}");
            return by_value.into_iter().map(|(_, records)| records).collect();
        }
        by_value
            .into_iter()
            .max_by(|a, b| compare(&a.0, &b.0))
            .map(|(_, records)| vec![records])
            .unwrap_or_default()
    }
}

fn compare(a: &FieldValue, b: &FieldValue) -> Ordering {
    use FieldValue::*;
    match (a, b) {
        (Missing, Missing) => Ordering::Equal,
        (Missing, _) => Ordering::Less,
        (_, Missing) => Ordering::Greater,
        (Number(x), Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Timestamp(x), Timestamp(y)) => x.cmp(y),
        (x, y) => x.to_string().cmp(&y.to_string()),
    }
}

fn preferred(group: Vec<Record>, prefer: &Preference) -> Vec<Record> {
    let ends_with = |r: &Record, suffix: &str| {
        r.field(&prefer.field)
            .map(|v| v.to_string().to_lowercase().ends_with(&suffix.to_lowercase()))
            .unwrap_or(false)
    };

    match prefer
        .suffixes
        .iter()
        .find(|s| group.iter().any(|r| ends_with(r, s.as_str())))
    {
        Some(suffix) => group.into_iter().filter(|r| ends_with(r, suffix.as_str())).collect(),
        None => group,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::ContentHash;

    fn record(source: &str, file: &str, year: f64) -> Record {
        Record {
            record_id: file.to_string(),
            fields: BTreeMap::from([
                ("ファイル名".to_string(), FieldValue::Text(file.to_string())),
                ("年度".to_string(), FieldValue::Number(year)),
            ]),
            source_content_hash: ContentHash::of(source.as_bytes()),
            parsed_at: Utc::now(),
        }
    }

    fn in_area(area: &str, file: &str) -> Record {
        let mut record = record("A", file, 2020.0);
        record
            .fields
            .insert("地域".into(), FieldValue::Text(area.to_string()));
        record
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.record_id.as_str()).collect()
    }

    fn ksj() -> Reduction {
        Reduction {
            latest_by: Some("年度".into()),
            prefer: Some(Preference {
                field: "ファイル名".into(),
                suffixes: vec!["_geojson.zip".into(), "_shp.zip".into()],
            }),
            ..Default::default()
        }
    }

    fn regions() -> Reduction {
        Reduction {
            coverage: Some(Coverage {
                field: "地域".into(),
                whole: vec!["全国".into()],
                fallback_suffixes: vec!["局".into()],
                areas: BTreeMap::from([
                    ("関東地方".to_string(), vec!["東京".to_string(), "千葉".to_string()]),
                    ("四国地方".to_string(), vec!["徳島".to_string(), "香川".to_string()]),
                ]),
            }),
            ..ksj()
        }
    }

    #[test]
    fn keeps_latest_year_in_preferred_format() {
        let records = vec![
            record("N03", "N03-2023_GML.zip", 2023.0),
            record("N03", "N03-2023_SHP.zip", 2023.0),
            record("N03", "N03-2023_GEOJSON.zip", 2023.0),
            record("N03", "N03-2022_GEOJSON.zip", 2022.0),
            record("A16", "A16-2015_GML.zip", 2015.0),
            record("A16", "A16-2015_SHP.zip", 2015.0),
            record("A16", "A16-2010_SHP.zip", 2010.0),
        ];
        let reduced = ksj().apply(records);
        let mut kept = ids(&reduced);
        kept.sort();
        assert_eq!(kept, vec!["A16-2015_SHP.zip", "N03-2023_GEOJSON.zip"]);
    }

    #[test]
    fn group_without_preferred_format_is_kept_whole() {
        let records = vec![
            record("P", "P-2020_1.zip", 2020.0),
            record("P", "P-2020_2.zip", 2020.0),
        ];
        assert_eq!(ids(&ksj().apply(records)), vec!["P-2020_1.zip", "P-2020_2.zip"]);
    }

    #[test]
    fn missing_value_keeps_every_year() {
        let mut undated = record("P", "P-x_SHP.zip", 0.0);
        undated.fields.insert("年度".into(), FieldValue::Missing);
        let records = vec![
            undated,
            record("P", "P-2001_GML.zip", 2001.0),
            record("P", "P-2001_SHP.zip", 2001.0),
            record("P", "P-2000_SHP.zip", 2000.0),
        ];
        assert_eq!(
            ids(&ksj().apply(records)),
            vec!["P-2000_SHP.zip", "P-2001_SHP.zip", "P-x_SHP.zip"]
        );
    }

    #[test]
    fn groups_by_fields() {
        let records = vec![
            record("P", "a-2001.zip", 2001.0),
            record("P", "a-2002.zip", 2002.0),
        ];
        let reduction = Reduction {
            group_by: vec!["ファイル名".into()],
            latest_by: Some("年度".into()),
            ..Default::default()
        };
        assert_eq!(reduction.apply(records).len(), 2);
    }

    #[test]
    fn nationwide_record_replaces_prefectures() {
        let records = vec![
            in_area("全国", "L-00_SHP.zip"),
            in_area("全国", "L-00_GML.zip"),
            in_area("東京", "L-13_SHP.zip"),
            in_area("香川", "L-37_SHP.zip"),
            in_area("関東地方整備局", "L-k_SHP.zip"),
        ];
        assert_eq!(ids(&regions().apply(records)), vec!["L-00_SHP.zip"]);
    }

    #[test]
    fn area_record_replaces_its_members() {
        let records = vec![
            in_area("関東地方", "L-kanto_SHP.zip"),
            in_area("東京", "L-13_SHP.zip"),
            in_area("千葉", "L-12_SHP.zip"),
            in_area("徳島", "L-36_SHP.zip"),
            in_area("香川", "L-37_SHP.zip"),
            in_area("メッシュ", "L-mesh_SHP.zip"),
            in_area("中部地方整備局", "L-chubu_SHP.zip"),
        ];
        assert_eq!(
            ids(&regions().apply(records)),
            vec!["L-36_SHP.zip", "L-37_SHP.zip", "L-kanto_SHP.zip", "L-mesh_SHP.zip"]
        );
    }

    #[test]
    fn bureau_records_survive_alone() {
        let records = vec![
            in_area("関東地方整備局", "L-k_SHP.zip"),
            in_area("近畿地方整備局", "L-n_SHP.zip"),
        ];
        assert_eq!(ids(&regions().apply(records)).len(), 2);
    }
}
