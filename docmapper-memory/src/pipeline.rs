//! Aggregation pipeline execution.
//!
//! Supported stages: `$match`, `$project`, `$sort`, `$skip`, `$limit`, `$unwind`,
//! `$lookup`, `$group`, `$count` and `$addFields`.

use bson::{Bson, Document};

use docmapper_core::error::{MapperError, MapperResult};

use crate::{
    evaluator::{DocumentEvaluator, compare, equal, number, project, resolve, sort_documents},
    modifier::{get_path, set_path},
};

fn stage_error(stage: &str, message: &str) -> MapperError {
    MapperError::BadQuery(format!("{stage}: {message}"))
}

/// Runs `pipeline` over `documents`. `foreign` returns the documents of another
/// collection for `$lookup`.
pub(crate) fn run<F>(mut documents: Vec<Document>, pipeline: &[Document], foreign: F) -> MapperResult<Vec<Document>>
where
    F: Fn(&str) -> Vec<Document>,
{
    for stage in pipeline {
        let Some((name, spec)) = stage.iter().next().filter(|_| stage.len() == 1) else {
            return Err(MapperError::BadQuery(format!("a pipeline stage must have exactly one key: {stage}")));
        };
        documents = match name.as_str() {
            "$match" => {
                let filter = spec.as_document().ok_or_else(|| stage_error(name, "needs a document"))?;
                DocumentEvaluator::filter_documents(documents.iter(), filter)?
            }
            "$project" => {
                let projection = spec.as_document().ok_or_else(|| stage_error(name, "needs a document"))?;
                documents
                    .iter()
                    .map(|document| project(document, projection))
                    .collect::<MapperResult<_>>()?
            }
            "$sort" => {
                let sort = spec.as_document().ok_or_else(|| stage_error(name, "needs a document"))?;
                sort_documents(&mut documents, sort);
                documents
            }
            "$skip" => {
                let skip = number(spec).ok_or_else(|| stage_error(name, "needs a number"))?;
                documents.into_iter().skip(skip.max(0.0) as usize).collect()
            }
            "$limit" => {
                let limit = number(spec).ok_or_else(|| stage_error(name, "needs a number"))?;
                documents.into_iter().take(limit.max(0.0) as usize).collect()
            }
            "$unwind" => unwind(documents, spec)?,
            "$lookup" => lookup(documents, spec, &foreign)?,
            "$group" => group(&documents, spec)?,
            "$count" => {
                let field = spec.as_str().ok_or_else(|| stage_error(name, "needs a field name"))?;
                let mut counted = Document::new();
                counted.insert(field, documents.len() as i64);
                vec![counted]
            }
            "$addFields" | "$set" => {
                let fields = spec.as_document().ok_or_else(|| stage_error(name, "needs a document"))?;
                let mut extended = Vec::with_capacity(documents.len());
                for mut document in documents {
                    for (path, expression) in fields {
                        let value = evaluate(&document, expression);
                        set_path(&mut document, path, value)?;
                    }
                    extended.push(document);
                }
                extended
            }
            other => return Err(MapperError::BadQuery(format!("unsupported pipeline stage: {other}"))),
        };
    }
    Ok(documents)
}

/// Value of an expression: `"$path"` reads a field, a document evaluates each entry and
/// anything else is a literal.
fn evaluate(document: &Document, expression: &Bson) -> Bson {
    match expression {
        Bson::String(path) if path.starts_with('$') => resolve(document, &path[1..])
            .into_iter()
            .next()
            .cloned()
            .unwrap_or(Bson::Null),
        Bson::Document(fields) => Bson::Document(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), evaluate(document, value)))
                .collect(),
        ),
        literal => literal.clone(),
    }
}

fn unwind(documents: Vec<Document>, spec: &Bson) -> MapperResult<Vec<Document>> {
    let (path, preserve) = match spec {
        Bson::String(path) => (path.as_str(), false),
        Bson::Document(options) => (
            options
                .get_str("path")
                .map_err(|_| stage_error("$unwind", "needs a path"))?,
            options.get_bool("preserveNullAndEmptyArrays").unwrap_or(false),
        ),
        _ => return Err(stage_error("$unwind", "needs a path")),
    };
    let path = path
        .strip_prefix('$')
        .ok_or_else(|| stage_error("$unwind", "path must start with $"))?;

    let mut unwound = Vec::with_capacity(documents.len());
    for document in documents {
        match get_path(&document, path).cloned() {
            Some(Bson::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = document.clone();
                    set_path(&mut copy, path, item)?;
                    unwound.push(copy);
                }
            }
            Some(Bson::Array(_)) | Some(Bson::Null) | None => {
                if preserve {
                    unwound.push(document);
                }
            }
            Some(_) => unwound.push(document),
        }
    }
    Ok(unwound)
}

fn lookup<F>(documents: Vec<Document>, spec: &Bson, foreign: &F) -> MapperResult<Vec<Document>>
where
    F: Fn(&str) -> Vec<Document>,
{
    let options = spec
        .as_document()
        .ok_or_else(|| stage_error("$lookup", "needs a document"))?;
    let field = |key: &str| {
        options
            .get_str(key)
            .map_err(|_| stage_error("$lookup", &format!("needs {key}")))
    };
    let (from, local_field, foreign_field, as_field) =
        (field("from")?, field("localField")?, field("foreignField")?, field("as")?);

    let candidates = foreign(from);
    let mut joined = Vec::with_capacity(documents.len());
    for mut document in documents {
        let local: Vec<Bson> = resolve(&document, local_field)
            .into_iter()
            .flat_map(|value| match value {
                Bson::Array(items) => items.clone(),
                other => vec![other.clone()],
            })
            .collect();
        let local = if local.is_empty() { vec![Bson::Null] } else { local };
        let matches: Vec<Bson> = candidates
            .iter()
            .filter(|candidate| {
                let values = resolve(candidate, foreign_field);
                if values.is_empty() {
                    return local.iter().any(|local| matches!(local, Bson::Null));
                }
                values.iter().any(|value| local.iter().any(|local| equal(value, local)))
            })
            .cloned()
            .map(Bson::Document)
            .collect();
        set_path(&mut document, as_field, Bson::Array(matches))?;
        joined.push(document);
    }
    Ok(joined)
}

fn group(documents: &[Document], spec: &Bson) -> MapperResult<Vec<Document>> {
    let spec = spec
        .as_document()
        .ok_or_else(|| stage_error("$group", "needs a document"))?;
    let key_expression = spec
        .get("_id")
        .ok_or_else(|| stage_error("$group", "needs an _id expression"))?;

    let mut groups: Vec<(Bson, Vec<&Document>)> = Vec::new();
    for document in documents {
        let key = evaluate(document, key_expression);
        match groups.iter_mut().find(|(existing, _)| equal(existing, &key)) {
            Some((_, members)) => members.push(document),
            None => groups.push((key, vec![document])),
        }
    }

    let mut output = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut result = Document::new();
        result.insert("_id", key);
        for (name, accumulator) in spec.iter().filter(|(name, _)| name.as_str() != "_id") {
            let (op, expression) = accumulator
                .as_document()
                .and_then(|accumulator| accumulator.iter().next())
                .ok_or_else(|| stage_error("$group", &format!("{name} needs an accumulator")))?;
            let values: Vec<Bson> = members.iter().map(|member| evaluate(member, expression)).collect();
            result.insert(name.clone(), accumulate(op, values)?);
        }
        output.push(result);
    }
    Ok(output)
}

fn accumulate(op: &str, values: Vec<Bson>) -> MapperResult<Bson> {
    let present = || values.iter().filter(|value| !matches!(value, Bson::Null));
    Ok(match op {
        "$sum" => {
            let numbers: Vec<&Bson> = values.iter().filter(|value| number(value).is_some()).collect();
            if numbers.iter().all(|value| matches!(value, Bson::Int32(_) | Bson::Int64(_))) {
                let total: i64 = numbers
                    .iter()
                    .filter_map(|value| number(value))
                    .map(|n| n as i64)
                    .sum();
                i32::try_from(total).map_or(Bson::Int64(total), Bson::Int32)
            } else {
                Bson::Double(numbers.iter().filter_map(|value| number(value)).sum())
            }
        }
        "$avg" => {
            let numbers: Vec<f64> = values.iter().filter_map(number).collect();
            if numbers.is_empty() {
                Bson::Null
            } else {
                Bson::Double(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        "$min" => present().min_by(|a, b| compare(a, b)).cloned().unwrap_or(Bson::Null),
        "$max" => present().max_by(|a, b| compare(a, b)).cloned().unwrap_or(Bson::Null),
        "$first" => values.first().cloned().unwrap_or(Bson::Null),
        "$last" => values.last().cloned().unwrap_or(Bson::Null),
        "$push" => Bson::Array(values),
        "$addToSet" => {
            let mut unique: Vec<Bson> = Vec::new();
            for value in values {
                if !unique.iter().any(|existing| equal(existing, &value)) {
                    unique.push(value);
                }
            }
            Bson::Array(unique)
        }
        "$count" => Bson::Int64(values.len() as i64),
        other => return Err(MapperError::BadQuery(format!("unsupported accumulator: {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    fn no_foreign(_: &str) -> Vec<Document> {
        Vec::new()
    }

    #[test]
    fn match_sort_and_page() {
        let documents = (1..=5).map(|n| doc! { "n": n, "odd": (n % 2 == 1) }).collect();
        let pipeline = [
            doc! { "$match": { "odd": true } },
            doc! { "$sort": { "n": -1 } },
            doc! { "$skip": 1_i64 },
            doc! { "$limit": 1_i64 },
            doc! { "$project": { "n": 1, "_id": 0 } },
        ];

        assert_eq!(run(documents, &pipeline, no_foreign).unwrap(), vec![doc! { "n": 3 }]);
    }

    #[test]
    fn unwind_and_group() {
        let documents = vec![
            doc! { "owner": "a", "tags": ["x", "y"] },
            doc! { "owner": "b", "tags": ["x"] },
            doc! { "owner": "c", "tags": [] },
        ];
        let pipeline = [
            doc! { "$unwind": "$tags" },
            doc! { "$group": { "_id": "$tags", "count": { "$sum": 1 }, "owners": { "$push": "$owner" } } },
            doc! { "$sort": { "_id": 1 } },
        ];

        assert_eq!(
            run(documents, &pipeline, no_foreign).unwrap(),
            vec![
                doc! { "_id": "x", "count": 2, "owners": ["a", "b"] },
                doc! { "_id": "y", "count": 1, "owners": ["a"] },
            ]
        );
    }

    #[test]
    fn lookup_joins_foreign_documents() {
        let orders = vec![doc! { "_id": 1, "customer": 7 }, doc! { "_id": 2, "customer": 8 }];
        let customers = vec![doc! { "_id": 7, "name": "ann" }];
        let pipeline = [doc! {
            "$lookup": { "from": "customers", "localField": "customer", "foreignField": "_id", "as": "who" }
        }];

        let joined = run(orders, &pipeline, |name| {
            assert_eq!(name, "customers");
            customers.clone()
        })
        .unwrap();

        assert_eq!(joined[0].get_array("who").unwrap().len(), 1);
        assert!(joined[1].get_array("who").unwrap().is_empty());
    }

    #[test]
    fn unknown_stages_are_rejected() {
        assert!(matches!(
            run(vec![], &[doc! { "$bogus": {} }], no_foreign),
            Err(MapperError::BadQuery(_))
        ));
    }
}
