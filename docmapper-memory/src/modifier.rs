//! Application of update documents to stored documents.

use bson::{Bson, Document};

use docmapper_core::error::{MapperError, MapperResult};

use crate::evaluator::{
    DocumentEvaluator, element_matches, equal, integer, matches_condition, number, resolve,
};

fn write_error(message: impl Into<String>) -> MapperError {
    MapperError::Backend(message.into())
}

/// Whether `update` is an operator document rather than a replacement.
pub(crate) fn is_operator_update(update: &Document) -> bool {
    update.keys().next().is_some_and(|key| key.starts_with('$'))
}

/// Applies every operator of `update` to `document`.
///
/// `filter` is the filter that selected the document; it resolves positional `$`
/// segments. `inserting` is set while seeding an upserted document.
pub(crate) fn apply_update(
    document: &mut Document,
    update: &Document,
    filter: &Document,
    inserting: bool,
) -> MapperResult<()> {
    for (op, fields) in update {
        let fields = fields
            .as_document()
            .ok_or_else(|| MapperError::BadQuery(format!("{op} needs a document of fields")))?;
        for (path, operand) in fields {
            let path = resolve_positional(document, filter, path)?;
            match op.as_str() {
                "$set" => set_path(document, &path, operand.clone())?,
                "$setOnInsert" => {
                    if inserting {
                        set_path(document, &path, operand.clone())?;
                    }
                }
                "$unset" => unset_path(document, &path),
                "$inc" => {
                    let current = get_path(document, &path).cloned().unwrap_or(Bson::Int32(0));
                    set_path(document, &path, add(&current, operand)?)?;
                }
                "$push" => {
                    let items = each(operand);
                    array_at(document, &path)?.extend(items);
                }
                "$pushAll" => {
                    let items = operand
                        .as_array()
                        .ok_or_else(|| MapperError::BadQuery("$pushAll needs an array".into()))?
                        .clone();
                    array_at(document, &path)?.extend(items);
                }
                "$addToSet" => {
                    let array = array_at(document, &path)?;
                    for item in each(operand) {
                        if !array.iter().any(|existing| equal(existing, &item)) {
                            array.push(item);
                        }
                    }
                }
                "$pull" => {
                    let array = array_at(document, &path)?;
                    let mut kept = Vec::with_capacity(array.len());
                    for item in array.drain(..) {
                        if !pulls(&item, operand)? {
                            kept.push(item);
                        }
                    }
                    *array = kept;
                }
                "$pullAll" => {
                    let values = operand
                        .as_array()
                        .ok_or_else(|| MapperError::BadQuery("$pullAll needs an array".into()))?;
                    array_at(document, &path)?.retain(|item| !values.iter().any(|value| equal(item, value)));
                }
                "$pop" => {
                    let array = array_at(document, &path)?;
                    if number(operand).is_some_and(|n| n < 0.0) {
                        if !array.is_empty() {
                            array.remove(0);
                        }
                    } else {
                        array.pop();
                    }
                }
                "$rename" => {
                    let target = operand
                        .as_str()
                        .ok_or_else(|| MapperError::BadQuery("$rename needs a string".into()))?;
                    if let Some(value) = get_path(document, &path).cloned() {
                        unset_path(document, &path);
                        set_path(document, target, value)?;
                    }
                }
                other => return Err(MapperError::BadQuery(format!("unknown update operator: {other}"))),
            }
        }
    }
    Ok(())
}

/// The items an `$push`/`$addToSet` operand adds: the `$each` list or the operand itself.
fn each(operand: &Bson) -> Vec<Bson> {
    match operand {
        Bson::Document(document) if document.contains_key("$each") => match document.get("$each") {
            Some(Bson::Array(items)) => items.clone(),
            _ => Vec::new(),
        },
        other => vec![other.clone()],
    }
}

fn pulls(item: &Bson, operand: &Bson) -> MapperResult<bool> {
    match operand {
        Bson::Document(condition) if condition.keys().all(|key| key.starts_with('$')) => {
            matches_condition(&[item], operand)
        }
        Bson::Document(condition) => match item {
            Bson::Document(element) => DocumentEvaluator::new(element).evaluate(condition),
            _ => Ok(false),
        },
        value => Ok(equal(item, value)),
    }
}

fn add(current: &Bson, increment: &Bson) -> MapperResult<Bson> {
    if let (Bson::Int32(a), Bson::Int32(b)) = (current, increment) {
        return Ok(a
            .checked_add(*b)
            .map_or(Bson::Int64(i64::from(*a) + i64::from(*b)), Bson::Int32));
    }
    if let (Some(a), Some(b)) = (integer(current), integer(increment)) {
        return Ok(Bson::Int64(a.saturating_add(b)));
    }
    match (number(current), number(increment)) {
        (Some(a), Some(b)) => Ok(Bson::Double(a + b)),
        _ => Err(write_error("Cannot apply $inc to a value of non-numeric type")),
    }
}

/// Replaces a positional `$` segment by the index of the first array element the filter
/// matched.
fn resolve_positional(document: &Document, filter: &Document, path: &str) -> MapperResult<String> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some(position) = segments.iter().position(|segment| *segment == "$") else {
        return Ok(path.to_string());
    };
    let prefix = segments[..position].join(".");
    let index = positional_index(document, filter, &prefix)?
        .ok_or_else(|| write_error("The positional operator did not find the match needed from the query"))?;
    let resolved: Vec<String> = segments
        .iter()
        .enumerate()
        .map(|(i, segment)| if i == position { index.to_string() } else { segment.to_string() })
        .collect();
    Ok(resolved.join("."))
}

fn positional_index(document: &Document, filter: &Document, prefix: &str) -> MapperResult<Option<usize>> {
    let Some(Bson::Array(items)) = get_path(document, prefix) else {
        return Ok(None);
    };
    'elements: for (index, item) in items.iter().enumerate() {
        let mut constrained = false;
        for (key, condition) in filter {
            if key == prefix {
                constrained = true;
                let matched = match condition {
                    Bson::Document(operators) if operators.contains_key("$elemMatch") => {
                        match operators.get("$elemMatch") {
                            Some(Bson::Document(expression)) => element_matches(item, expression)?,
                            _ => false,
                        }
                    }
                    other => matches_condition(&[item], other)?,
                };
                if !matched {
                    continue 'elements;
                }
            } else if let Some(rest) = key.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('.')) {
                constrained = true;
                let Bson::Document(element) = item else {
                    continue 'elements;
                };
                if !matches_condition(&resolve(element, rest), condition)? {
                    continue 'elements;
                }
            }
        }
        if constrained {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// The value at an exact dotted path, without fanning out over arrays.
pub(crate) fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Bson::Document(child) => child.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

fn get_path_mut<'a>(document: &'a mut Document, path: &str) -> Option<&'a mut Bson> {
    let (head, rest) = split_path(path);
    let value = document.get_mut(head)?;
    match rest {
        Some(rest) => value_path_mut(value, rest),
        None => Some(value),
    }
}

fn value_path_mut<'a>(value: &'a mut Bson, path: &str) -> Option<&'a mut Bson> {
    let (head, rest) = split_path(path);
    let child = match value {
        Bson::Document(document) => document.get_mut(head)?,
        Bson::Array(items) => items.get_mut(head.parse::<usize>().ok()?)?,
        _ => return None,
    };
    match rest {
        Some(rest) => value_path_mut(child, rest),
        None => Some(child),
    }
}

/// Sets the value at a dotted path, creating intermediate documents.
pub(crate) fn set_path(document: &mut Document, path: &str, value: Bson) -> MapperResult<()> {
    let segments: Vec<&str> = path.split('.').collect();
    set_in_document(document, &segments, value)
}

fn set_in_document(document: &mut Document, segments: &[&str], value: Bson) -> MapperResult<()> {
    let Some((head, rest)) = segments.split_first() else {
        return Ok(());
    };
    if rest.is_empty() {
        document.insert(*head, value);
        return Ok(());
    }
    let child = document
        .entry(head.to_string())
        .or_insert_with(|| Bson::Document(Document::new()));
    set_in_value(child, rest, value)
}

fn set_in_value(target: &mut Bson, segments: &[&str], value: Bson) -> MapperResult<()> {
    if matches!(target, Bson::Null) {
        *target = Bson::Document(Document::new());
    }
    match target {
        Bson::Document(document) => set_in_document(document, segments, value),
        Bson::Array(items) => {
            let Some((head, rest)) = segments.split_first() else {
                return Ok(());
            };
            let index: usize = head
                .parse()
                .map_err(|_| write_error(format!("cannot create field '{head}' in an array")))?;
            while items.len() <= index {
                items.push(Bson::Null);
            }
            if rest.is_empty() {
                items[index] = value;
                Ok(())
            } else {
                set_in_value(&mut items[index], rest, value)
            }
        }
        other => Err(write_error(format!(
            "cannot create field '{}' in element {other}",
            segments.first().copied().unwrap_or_default()
        ))),
    }
}

/// Removes the value at a dotted path. Array elements are nulled rather than removed.
pub(crate) fn unset_path(document: &mut Document, path: &str) {
    let Some((parent, leaf)) = path.rsplit_once('.') else {
        document.remove(path);
        return;
    };
    match get_path_mut(document, parent) {
        Some(Bson::Document(child)) => {
            child.remove(leaf);
        }
        Some(Bson::Array(items)) => {
            if let Some(item) = leaf.parse::<usize>().ok().and_then(|index| items.get_mut(index)) {
                *item = Bson::Null;
            }
        }
        _ => {}
    }
}

fn array_at<'a>(document: &'a mut Document, path: &str) -> MapperResult<&'a mut Vec<Bson>> {
    if get_path(document, path).is_none() {
        set_path(document, path, Bson::Array(Vec::new()))?;
    }
    match get_path_mut(document, path) {
        Some(Bson::Array(items)) => Ok(items),
        _ => Err(write_error(format!("The field '{path}' must be an array"))),
    }
}

/// The document an upsert starts from: the filter's equality conditions.
pub(crate) fn seed_from_filter(filter: &Document) -> MapperResult<Document> {
    let mut seed = Document::new();
    seed_into(&mut seed, filter)?;
    Ok(seed)
}

fn seed_into(seed: &mut Document, filter: &Document) -> MapperResult<()> {
    for (key, condition) in filter {
        if key == "$and" {
            for clause in condition.as_array().into_iter().flatten().filter_map(Bson::as_document) {
                seed_into(seed, clause)?;
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        match condition {
            Bson::Document(operators) if operators.keys().all(|k| k.starts_with('$')) && !operators.is_empty() => {
                if let Some(value) = operators.get("$eq") {
                    set_path(seed, key, value.clone())?;
                }
            }
            Bson::RegularExpression(_) => {}
            value => set_path(seed, key, value.clone())?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    fn updated(mut document: Document, update: Document) -> Document {
        apply_update(&mut document, &update, &Document::new(), false).unwrap();
        document
    }

    #[test]
    fn set_creates_intermediate_documents() {
        assert_eq!(
            updated(doc! { "a": 1 }, doc! { "$set": { "b.c": 2 }, "$unset": { "a": true } }),
            doc! { "b": { "c": 2 } }
        );
    }

    #[test]
    fn inc_widens_integers() {
        assert_eq!(updated(doc! { "n": 1 }, doc! { "$inc": { "n": 2 } }), doc! { "n": 3 });
        assert_eq!(
            updated(doc! { "n": i32::MAX }, doc! { "$inc": { "n": 1 } }),
            doc! { "n": i64::from(i32::MAX) + 1 }
        );
        assert_eq!(updated(doc! {}, doc! { "$inc": { "n": 1.5 } }), doc! { "n": 1.5 });

        let mut document = doc! { "n": "x" };
        assert!(matches!(
            apply_update(&mut document, &doc! { "$inc": { "n": 1 } }, &Document::new(), false),
            Err(MapperError::Backend(_))
        ));
    }

    #[test]
    fn array_operators() {
        let document = doc! { "tags": ["a", "b", "c"] };

        assert_eq!(
            updated(document.clone(), doc! { "$push": { "tags": "d" } }),
            doc! { "tags": ["a", "b", "c", "d"] }
        );
        assert_eq!(
            updated(document.clone(), doc! { "$pushAll": { "tags": ["d", "e"] } }),
            doc! { "tags": ["a", "b", "c", "d", "e"] }
        );
        assert_eq!(
            updated(document.clone(), doc! { "$addToSet": { "tags": { "$each": ["a", "z"] } } }),
            doc! { "tags": ["a", "b", "c", "z"] }
        );
        assert_eq!(
            updated(document.clone(), doc! { "$pull": { "tags": { "$in": ["a", "c"] } } }),
            doc! { "tags": ["b"] }
        );
        assert_eq!(
            updated(document.clone(), doc! { "$pullAll": { "tags": ["b"] } }),
            doc! { "tags": ["a", "c"] }
        );
        assert_eq!(
            updated(document.clone(), doc! { "$pop": { "tags": -1 } }),
            doc! { "tags": ["b", "c"] }
        );
        assert_eq!(updated(document, doc! { "$pop": { "tags": 1 } }), doc! { "tags": ["a", "b"] });
    }

    #[test]
    fn positional_segment_targets_the_matched_element() {
        let mut document = doc! { "items": [{ "sku": "x", "qty": 1 }, { "sku": "y", "qty": 2 }] };
        apply_update(
            &mut document,
            &doc! { "$set": { "items.$.qty": 9 } },
            &doc! { "items.sku": "y" },
            false,
        )
        .unwrap();

        assert_eq!(document, doc! { "items": [{ "sku": "x", "qty": 1 }, { "sku": "y", "qty": 9 }] });
    }

    #[test]
    fn upsert_seed_keeps_equality_conditions() {
        let seed = seed_from_filter(&doc! {
            "name": "bot",
            "age": { "$gt": 3 },
            "kind": { "$eq": "a" },
            "$and": [{ "meta.x": 1 }],
        })
        .unwrap();

        assert_eq!(seed, doc! { "name": "bot", "kind": "a", "meta": { "x": 1 } });
    }
}
