//! Moodle teaching-material application profile
//!
//! Each Moodle file JSON becomes one record. Rules:
//! - id `moodle:<id>`, or `moodle:<fileurl>` when the entry has no id
//! - title falls back to the file name
//! - `abstract` (HTML-unescaped) is the description
//! - `resourcetype` maps onto a learning resource type
//! - `semester`/`year` form the version string
//! - OEFOS classification ids are ordered most specific first
//!
//! Every course a file belongs to also gets a course record
//! (`moodle-course:<courseid>`), and every course/semester pair a unit
//! record (`moodle-unit:<courseid>:<semester>-<year>`). Units list their
//! files, courses list their units. The Moodle-only course `0` has neither.

use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::{check_decoded, non_empty, normalize_files, parse_modified, Normalizer, ValidationError};
use crate::config::SchemaProfile;
use crate::models::{CanonicalRecord, ManifestEntry, ManifestFile, RecordMetadata};

const NAMESPACE: &str = "moodle";
const COURSE_NAMESPACE: &str = "moodle-course";
const UNIT_NAMESPACE: &str = "moodle-unit";

/// Course id shared by all Moodle-only courses
const MOODLE_ONLY_COURSE_ID: &str = "0";

const SEMESTERS: &[&str] = &["SS", "WS"];

#[derive(Debug, Clone, Copy, Default)]
pub struct MoodleNormalizer;

#[derive(Default)]
struct CourseParts {
    name: Option<String>,
    units: BTreeSet<String>,
}

struct UnitParts {
    courseid: String,
    version: String,
    files: BTreeSet<String>,
}

impl Normalizer for MoodleNormalizer {
    fn profile(&self) -> SchemaProfile {
        SchemaProfile::Moodle
    }

    /// Moodle file JSONs describe exactly one file through
    /// `fileurl`/`contenthash`/`filesize`
    fn prepare(&self, entry: &mut ManifestEntry) {
        if entry.files.is_some() {
            return;
        }
        let Some(fileurl) = non_empty(entry.extra_str("fileurl").as_deref()) else {
            return;
        };

        entry.files = Some(vec![ManifestFile {
            name: file_name_from_url(&fileurl),
            checksum: non_empty(entry.extra_str("contenthash").as_deref()),
            size: entry
                .extra_str("filesize")
                .and_then(|s| s.trim().parse::<u64>().ok()),
            reference: Some(fileurl),
        }]);
    }

    fn external_id(&self, entry: &ManifestEntry) -> Option<String> {
        non_empty(entry.id.as_deref())
            .or_else(|| non_empty(entry.extra_str("fileurl").as_deref()))
            .map(|id| format!("{}:{}", NAMESPACE, id))
    }

    fn normalize(&self, entry: &ManifestEntry) -> Result<CanonicalRecord, ValidationError> {
        check_decoded(entry)?;

        let mut entry = entry.clone();
        self.prepare(&mut entry);

        let external_id = self
            .external_id(&entry)
            .ok_or_else(|| ValidationError::MissingField("id".to_string()))?;

        let files = normalize_files(entry.files.as_deref().unwrap_or_default())?;

        let title = non_empty(entry.title.as_deref())
            .or_else(|| files.first().map(|f| f.name.clone()))
            .ok_or_else(|| ValidationError::MissingField("title".to_string()))?;

        let description = non_empty(entry.extra_str("abstract").as_deref())
            .map(|a| unescape_html(&a))
            .or_else(|| non_empty(entry.description.as_deref()));

        let mut fields = BTreeMap::new();
        fields.insert("resource_type".to_string(), json!("file"));

        if let Some(language) = non_empty(entry.extra_str("language").as_deref()) {
            fields.insert("language".to_string(), json!(language));
        }

        let keywords = tags(&entry)?;
        if !keywords.is_empty() {
            fields.insert("keywords".to_string(), json!(keywords));
        }

        let contributors = persons(&entry)?;
        if !contributors.is_empty() {
            fields.insert("contributors".to_string(), Value::Array(contributors));
        }

        if let Some(released) = time_released(&entry)? {
            fields.insert("released".to_string(), json!(released));
        }

        if let Some(format) = non_empty(entry.extra_str("mimetype").as_deref()) {
            fields.insert("format".to_string(), json!(format));
        }

        if let Some(license) = entry
            .extra
            .get("license")
            .and_then(|l| l.get("source"))
            .and_then(Value::as_str)
            .and_then(|s| non_empty(Some(s)))
        {
            fields.insert("license".to_string(), json!(license));
        }

        if let Some(kind) = learning_resource_type(&entry)? {
            fields.insert("learning_resource_type".to_string(), json!(kind));
        }

        if let Some(version) = version(&entry)? {
            fields.insert("version".to_string(), json!(version));
        }

        let classification = oefos_ids(&entry)?;
        if !classification.is_empty() {
            fields.insert("classification".to_string(), json!(classification));
        }

        let courses = courses(&entry)?;
        if !courses.is_empty() {
            fields.insert("courses".to_string(), Value::Array(courses));
        }

        Ok(CanonicalRecord {
            external_id,
            metadata: RecordMetadata {
                title,
                description,
                fields,
            },
            files,
            source_modified_at: parse_modified(entry.last_modified.as_deref())?,
        })
    }

    fn derive(&self, records: &[CanonicalRecord]) -> Vec<CanonicalRecord> {
        let mut courses: BTreeMap<String, CourseParts> = BTreeMap::new();
        let mut units: BTreeMap<String, UnitParts> = BTreeMap::new();

        for record in records {
            let version = record.metadata.fields.get("version").and_then(Value::as_str);
            let Some(Value::Array(linked)) = record.metadata.fields.get("courses") else {
                continue;
            };

            for course in linked {
                let Some(courseid) = course.get("courseid").and_then(Value::as_str) else {
                    continue;
                };
                let parts = courses.entry(courseid.to_string()).or_default();
                if parts.name.is_none() {
                    parts.name = non_empty(course.get("coursename").and_then(Value::as_str));
                }

                // Units are per semester; files without one only join the course
                let Some(version) = version else {
                    continue;
                };
                let unit_id = format!("{}:{}:{}", UNIT_NAMESPACE, courseid, version.replace(' ', "-"));
                parts.units.insert(unit_id.clone());
                units
                    .entry(unit_id)
                    .or_insert_with(|| UnitParts {
                        courseid: courseid.to_string(),
                        version: version.to_string(),
                        files: BTreeSet::new(),
                    })
                    .files
                    .insert(record.external_id.clone());
            }
        }

        let course_title = |courseid: &str| {
            courses
                .get(courseid)
                .and_then(|c| c.name.clone())
                .unwrap_or_else(|| format!("Course {}", courseid))
        };

        let course_records = courses.iter().map(|(courseid, parts)| {
            let mut fields = BTreeMap::new();
            fields.insert("resource_type".to_string(), json!("course"));
            fields.insert("courseid".to_string(), json!(courseid));
            fields.insert("parts".to_string(), json!(parts.units));
            aggregate(
                format!("{}:{}", COURSE_NAMESPACE, courseid),
                course_title(courseid),
                fields,
            )
        });

        let unit_records = units.iter().map(|(unit_id, unit)| {
            let mut fields = BTreeMap::new();
            fields.insert("resource_type".to_string(), json!("unit"));
            fields.insert("courseid".to_string(), json!(unit.courseid));
            fields.insert("version".to_string(), json!(unit.version));
            fields.insert("parts".to_string(), json!(unit.files));
            aggregate(
                unit_id.clone(),
                format!("{} ({})", course_title(&unit.courseid), unit.version),
                fields,
            )
        });

        course_records.chain(unit_records).collect()
    }

    fn is_derived(&self, external_id: &str) -> bool {
        [COURSE_NAMESPACE, UNIT_NAMESPACE].iter().any(|namespace| {
            external_id
                .strip_prefix(namespace)
                .is_some_and(|rest| rest.starts_with(':'))
        })
    }
}

/// Course or unit record; these carry no files
fn aggregate(external_id: String, title: String, fields: BTreeMap<String, Value>) -> CanonicalRecord {
    CanonicalRecord {
        external_id,
        metadata: RecordMetadata {
            title,
            description: None,
            fields,
        },
        files: Vec::new(),
        source_modified_at: None,
    }
}

/// Last path segment of a URL, percent-decoded
fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(&['?', '#'][..]).next().unwrap_or(url);
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    let decoded = percent_encoding::percent_decode_str(segment).decode_utf8_lossy();
    non_empty(Some(decoded.as_ref()))
}

fn array_field<'a>(entry: &'a ManifestEntry, key: &str) -> Result<&'a [Value], ValidationError> {
    match entry.extra.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(ValidationError::invalid(key, "expected an array")),
    }
}

fn tags(entry: &ManifestEntry) -> Result<Vec<String>, ValidationError> {
    array_field(entry, "tags")?
        .iter()
        .filter_map(|tag| match tag {
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(Ok(s.trim().to_string())),
            _ => Some(Err(ValidationError::invalid("tags", "expected strings"))),
        })
        .collect()
}

fn persons(entry: &ManifestEntry) -> Result<Vec<Value>, ValidationError> {
    array_field(entry, "persons")?
        .iter()
        .map(|person| {
            let name = format!("{} {}", text(person, "firstname"), text(person, "lastname"))
                .trim()
                .to_string();
            if name.is_empty() {
                return Err(ValidationError::invalid("persons", "person without a name"));
            }
            let mut contributor = serde_json::Map::new();
            contributor.insert("name".to_string(), json!(name));
            let role = text(person, "role");
            if !role.is_empty() {
                contributor.insert("role".to_string(), json!(role));
            }
            Ok(Value::Object(contributor))
        })
        .collect()
}

fn text<'a>(object: &'a Value, key: &str) -> &'a str {
    object.get(key).and_then(Value::as_str).unwrap_or("").trim()
}

/// ISO date of `timereleased` (unix seconds)
fn time_released(entry: &ManifestEntry) -> Result<Option<String>, ValidationError> {
    let Some(raw) = non_empty(entry.extra_str("timereleased").as_deref()) else {
        return Ok(None);
    };

    raw.parse::<i64>()
        .ok()
        .and_then(lmsync_common::time::unix_seconds_to_date)
        .map(|date| Some(date.format("%Y-%m-%d").to_string()))
        .ok_or_else(|| ValidationError::invalid("timereleased", format!("not a unix timestamp: {:?}", raw)))
}

fn learning_resource_type(entry: &ManifestEntry) -> Result<Option<&'static str>, ValidationError> {
    match non_empty(entry.extra_str("resourcetype").as_deref()).as_deref() {
        None | Some("No selection") => Ok(None),
        Some("Presentationslide") => Ok(Some("slide")),
        Some("Exercise") => Ok(Some("assessment")),
        Some(other) => Err(ValidationError::invalid(
            "resourcetype",
            format!("unknown resource type {:?}", other),
        )),
    }
}

fn version(entry: &ManifestEntry) -> Result<Option<String>, ValidationError> {
    let semester = non_empty(entry.extra_str("semester").as_deref());
    let year = non_empty(entry.extra_str("year").as_deref());

    match (semester, year) {
        (None, None) => Ok(None),
        (Some(semester), Some(year)) => {
            if !SEMESTERS.contains(&semester.as_str()) {
                return Err(ValidationError::invalid(
                    "semester",
                    format!("expected SS or WS, got {:?}", semester),
                ));
            }
            Ok(Some(format!("{} {}", semester, year)))
        }
        (None, Some(_)) => Err(ValidationError::MissingField("semester".to_string())),
        (Some(_), None) => Err(ValidationError::MissingField("year".to_string())),
    }
}

/// OEFOS ids, more specific codes before their prefixes
///
/// `["2", "234", "2345", "123", "1234"]` orders as
/// `["1234", "123", "2345", "234", "2"]`.
fn oefos_ids(entry: &ManifestEntry) -> Result<Vec<String>, ValidationError> {
    let mut ids = Vec::new();
    for classification in array_field(entry, "classification")? {
        let values = match classification.get("values") {
            None | Some(Value::Null) => continue,
            Some(Value::Array(values)) => values,
            Some(_) => return Err(ValidationError::invalid("classification", "values must be an array")),
        };
        for value in values {
            match value.get("identifier") {
                Some(Value::String(id)) if !id.trim().is_empty() => ids.push(id.trim().to_string()),
                Some(Value::Number(id)) => ids.push(id.to_string()),
                _ => return Err(ValidationError::invalid("classification", "value without identifier")),
            }
        }
    }

    ids.sort_by_key(|id| oefos_sort_key(id));
    Ok(ids)
}

fn oefos_sort_key(id: &str) -> String {
    let mut key = id.to_string();
    while key.chars().count() < 6 {
        key.push(char::MAX);
    }
    key
}

fn courses(entry: &ManifestEntry) -> Result<Vec<Value>, ValidationError> {
    let mut courses = Vec::new();
    for course in array_field(entry, "courses")? {
        let courseid = match course.get("courseid") {
            Some(Value::String(id)) => id.trim().to_string(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(ValidationError::MissingField("courses[].courseid".to_string())),
        };
        if courseid == MOODLE_ONLY_COURSE_ID {
            continue;
        }
        let coursename = text(course, "coursename");
        courses.push(json!({"courseid": courseid, "coursename": coursename}));
    }
    Ok(courses)
}

/// Decode HTML character references as found in Moodle abstracts
fn unescape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];

        let decoded = after.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &after[..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" | "#39" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ if entity.starts_with("#x") || entity.starts_with("#X") => {
                    u32::from_str_radix(&entity[2..], 16).ok().and_then(char::from_u32)
                }
                _ if entity.starts_with('#') => entity[1..].parse::<u32>().ok().and_then(char::from_u32),
                _ => None,
            };
            ch.map(|c| (c, end))
        });

        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &after[end + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}
