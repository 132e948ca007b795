//! Operator translation for MongoDB compatibility.
//!
//! The query compiler emits a few legacy operators that current MongoDB servers reject.
//! This module rewrites them into their modern equivalents before a document is sent:
//!
//! - `$pushAll: { f: [..] }` becomes `$push: { f: { $each: [..] } }`
//! - `$within` becomes `$geoWithin`

use bson::{Bson, Document};

/// Rewrites legacy operators in filters, updates and pipelines.
pub(crate) struct OperatorSanitizer;

impl OperatorSanitizer {
    /// Operator renames applied anywhere inside a filter.
    const FILTER_RENAMES: [(&'static str, &'static str); 1] = [("$within", "$geoWithin")];

    /// Recursively sanitizes a filter document.
    pub(crate) fn sanitize_filter(filter: Document) -> Document {
        filter
            .into_iter()
            .map(|(key, value)| (Self::rename(key), Self::sanitize_value(value)))
            .collect()
    }

    fn sanitize_value(value: Bson) -> Bson {
        match value {
            Bson::Document(document) => Bson::Document(Self::sanitize_filter(document)),
            Bson::Array(items) => Bson::Array(items.into_iter().map(Self::sanitize_value).collect()),
            other => other,
        }
    }

    fn rename(key: String) -> String {
        Self::FILTER_RENAMES
            .iter()
            .find(|(legacy, _)| *legacy == key)
            .map(|(_, modern)| modern.to_string())
            .unwrap_or(key)
    }

    /// Sanitizes an update document. `$pushAll` entries are merged into `$push`.
    pub(crate) fn sanitize_update(update: Document) -> Document {
        let mut sanitized = Document::new();
        let mut pushes = Document::new();

        for (op, spec) in update {
            match (op.as_str(), spec) {
                ("$pushAll", Bson::Document(fields)) => {
                    for (field, values) in fields {
                        let mut each = Document::new();
                        each.insert("$each", values);
                        pushes.insert(field, each);
                    }
                }
                ("$push", Bson::Document(fields)) => {
                    for (field, value) in fields {
                        pushes.insert(field, value);
                    }
                }
                (_, spec) => {
                    sanitized.insert(op, spec);
                }
            }
        }

        if !pushes.is_empty() {
            sanitized.insert("$push", pushes);
        }
        sanitized
    }

    /// Sanitizes the `$match` stages of an aggregation pipeline.
    pub(crate) fn sanitize_pipeline(pipeline: Vec<Document>) -> Vec<Document> {
        pipeline
            .into_iter()
            .map(|stage| {
                stage
                    .into_iter()
                    .map(|(name, spec)| match (name.as_str(), spec) {
                        ("$match", Bson::Document(filter)) => (name, Bson::Document(Self::sanitize_filter(filter))),
                        (_, spec) => (name, spec),
                    })
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn push_all_becomes_push_each() {
        let update = doc! {
            "$set": { "name": "bot" },
            "$pushAll": { "tags": ["a", "b"] },
            "$push": { "log": "x" },
        };

        assert_eq!(
            OperatorSanitizer::sanitize_update(update),
            doc! {
                "$set": { "name": "bot" },
                "$push": { "tags": { "$each": ["a", "b"] }, "log": "x" },
            }
        );
    }

    #[test]
    fn within_becomes_geo_within_at_any_depth() {
        let filter = doc! {
            "$or": [
                { "loc": { "$within": { "$box": [[0, 0], [1, 1]] } } },
                { "name": "x" },
            ]
        };

        assert_eq!(
            OperatorSanitizer::sanitize_filter(filter),
            doc! {
                "$or": [
                    { "loc": { "$geoWithin": { "$box": [[0, 0], [1, 1]] } } },
                    { "name": "x" },
                ]
            }
        );
    }

    #[test]
    fn pipeline_match_stages_are_sanitized() {
        let pipeline = vec![
            doc! { "$match": { "loc": { "$within": { "$center": [[0, 0], 1] } } } },
            doc! { "$limit": 1 },
        ];

        let sanitized = OperatorSanitizer::sanitize_pipeline(pipeline);

        assert!(sanitized[0].get_document("$match").unwrap().get_document("loc").unwrap().contains_key("$geoWithin"));
        assert_eq!(sanitized[1], doc! { "$limit": 1 });
    }

    #[test]
    fn updates_without_legacy_operators_are_unchanged() {
        let update = doc! { "$inc": { "n": 1 }, "$unset": { "m": true } };
        assert_eq!(OperatorSanitizer::sanitize_update(update.clone()), update);
    }
}
