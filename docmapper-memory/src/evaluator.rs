//! Query expression evaluation for in-memory document filtering.
//!
//! This module evaluates store filter documents against BSON documents and implements the
//! read-side helpers `find` needs: dotted path resolution, value ordering, projection and
//! sorting. Comparison follows the store's cross-type ordering, so values of different
//! types sort by type bracket first and only values of one bracket satisfy a range operator.

use std::cmp::Ordering;

use bson::{Bson, Document};
use regex::{Regex, RegexBuilder};

use docmapper_core::error::{MapperError, MapperResult};

static NULL: Bson = Bson::Null;

/// Sort bracket of a value.
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => u8::MAX,
        _ => 12,
    }
}

pub(crate) fn integer(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

pub(crate) fn number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Total order over BSON values.
pub(crate) fn compare(left: &Bson, right: &Bson) -> Ordering {
    let (left_rank, right_rank) = (type_rank(left), type_rank(right));
    if left_rank != right_rank {
        return left_rank.cmp(&right_rank);
    }
    match (left, right) {
        (Bson::String(a), Bson::String(b)) => a.cmp(b),
        (Bson::Document(a), Bson::Document(b)) => compare_documents(a, b),
        (Bson::Array(a), Bson::Array(b)) => compare_sequences(a, b),
        (Bson::Binary(a), Bson::Binary(b)) => a.bytes.len().cmp(&b.bytes.len()).then_with(|| a.bytes.cmp(&b.bytes)),
        (Bson::ObjectId(a), Bson::ObjectId(b)) => a.bytes().cmp(&b.bytes()),
        (Bson::Boolean(a), Bson::Boolean(b)) => a.cmp(b),
        (Bson::DateTime(a), Bson::DateTime(b)) => a.cmp(b),
        (Bson::Timestamp(a), Bson::Timestamp(b)) => (a.time, a.increment).cmp(&(b.time, b.increment)),
        (Bson::RegularExpression(a), Bson::RegularExpression(b)) => a.pattern.as_str().cmp(b.pattern.as_str()),
        (a, b) if left_rank == 2 => match (integer(a), integer(b)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => match (number(a), number(b)) {
                (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            },
        },
        (a, b) if a == b => Ordering::Equal,
        (a, b) => format!("{a:?}").cmp(&format!("{b:?}")),
    }
}

fn compare_documents(left: &Document, right: &Document) -> Ordering {
    for ((left_key, left_value), (right_key, right_value)) in left.iter().zip(right.iter()) {
        let ordering = compare(left_value, right_value).then_with(|| left_key.cmp(right_key));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

fn compare_sequences(left: &[Bson], right: &[Bson]) -> Ordering {
    for (left, right) in left.iter().zip(right.iter()) {
        let ordering = compare(left, right);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

pub(crate) fn equal(left: &Bson, right: &Bson) -> bool {
    compare(left, right) == Ordering::Equal
}

/// Every value reachable at the dotted `path`, fanning out over arrays of documents.
/// Numeric segments index into arrays.
pub(crate) fn resolve<'a>(document: &'a Document, path: &str) -> Vec<&'a Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut values = Vec::new();
    if let Some((head, rest)) = segments.split_first()
        && let Some(value) = document.get(*head)
    {
        descend(value, rest, &mut values);
    }
    values
}

fn descend<'a>(value: &'a Bson, segments: &[&str], out: &mut Vec<&'a Bson>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Bson::Document(document) => {
            if let Some(child) = document.get(*head) {
                descend(child, rest, out);
            }
        }
        Bson::Array(items) => match head.parse::<usize>() {
            Ok(index) => {
                if let Some(item) = items.get(index) {
                    descend(item, rest, out);
                }
            }
            Err(_) => {
                for item in items.iter().filter(|item| matches!(item, Bson::Document(_))) {
                    descend(item, segments, out);
                }
            }
        },
        _ => {}
    }
}

/// The resolved values plus the elements of resolved arrays.
fn candidates<'a>(values: &[&'a Bson]) -> Vec<&'a Bson> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        out.push(*value);
        if let Bson::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn equals_any(values: &[&Bson], operand: &Bson) -> bool {
    if matches!(operand, Bson::Null) && values.iter().all(|value| matches!(value, Bson::Null)) {
        return true;
    }
    candidates(values).iter().any(|candidate| equal(candidate, operand))
}

fn is_operator_document(document: &Document) -> bool {
    !document.is_empty() && !document.contains_key("$ref") && document.keys().all(|key| key.starts_with('$'))
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(flag) => *flag,
        Bson::Null | Bson::Undefined => false,
        other => number(other).is_none_or(|n| n != 0.0),
    }
}

fn compile(pattern: &str, options: &str) -> MapperResult<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| MapperError::BadQuery(format!("invalid regular expression {pattern:?}: {e}")))
}

fn matches_regex(values: &[&Bson], regex: &Regex) -> bool {
    candidates(values)
        .iter()
        .any(|candidate| candidate.as_str().is_some_and(|text| regex.is_match(text)))
}

fn operand_array<'a>(op: &str, operand: &'a Bson) -> MapperResult<&'a Vec<Bson>> {
    operand
        .as_array()
        .ok_or_else(|| MapperError::BadQuery(format!("{op} needs an array")))
}

/// Tests the values found at a path against a filter condition: a literal, a regular
/// expression or an operator document.
pub(crate) fn matches_condition(values: &[&Bson], condition: &Bson) -> MapperResult<bool> {
    match condition {
        Bson::Document(operators) if is_operator_document(operators) => {
            for (op, operand) in operators {
                if !apply_operator(values, op, operand, operators)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Bson::RegularExpression(regex) => {
            let regex = compile(regex.pattern.as_str(), regex.options.as_str())?;
            Ok(matches_regex(values, &regex))
        }
        literal => Ok(equals_any(values, literal)),
    }
}

/// Whether one array element satisfies an `$elemMatch` expression.
pub(crate) fn element_matches(element: &Bson, expression: &Document) -> MapperResult<bool> {
    if is_operator_document(expression) {
        return matches_condition(&[element], &Bson::Document(expression.clone()));
    }
    match element {
        Bson::Document(document) => DocumentEvaluator::new(document).evaluate(expression),
        _ => Ok(false),
    }
}

fn apply_operator(values: &[&Bson], op: &str, operand: &Bson, siblings: &Document) -> MapperResult<bool> {
    let ordered = |accept: fn(Ordering) -> bool| {
        candidates(values)
            .iter()
            .any(|candidate| type_rank(candidate) == type_rank(operand) && accept(compare(candidate, operand)))
    };
    Ok(match op {
        "$eq" => equals_any(values, operand),
        "$ne" => !equals_any(values, operand),
        "$gt" => ordered(Ordering::is_gt),
        "$gte" => ordered(Ordering::is_ge),
        "$lt" => ordered(Ordering::is_lt),
        "$lte" => ordered(Ordering::is_le),
        "$in" => any_of(values, operand_array(op, operand)?)?,
        "$nin" => !any_of(values, operand_array(op, operand)?)?,
        "$exists" => truthy(operand) == !values.is_empty(),
        "$regex" => {
            let options = siblings.get_str("$options").unwrap_or_default();
            let regex = match operand {
                Bson::String(pattern) => compile(pattern, options)?,
                Bson::RegularExpression(regex) => {
                    compile(regex.pattern.as_str(), &format!("{}{options}", regex.options.as_str()))?
                }
                _ => return Err(MapperError::BadQuery("$regex needs a string".into())),
            };
            matches_regex(values, &regex)
        }
        "$options" | "$maxDistance" => true,
        "$not" => !matches_condition(values, operand)?,
        "$elemMatch" => {
            let expression = operand
                .as_document()
                .ok_or_else(|| MapperError::BadQuery("$elemMatch needs a document".into()))?;
            let mut matched = false;
            for value in values {
                if let Bson::Array(items) = value {
                    for item in items {
                        if element_matches(item, expression)? {
                            matched = true;
                            break;
                        }
                    }
                }
            }
            matched
        }
        "$all" => operand_array(op, operand)?
            .iter()
            .all(|item| equals_any(values, item)),
        "$size" => {
            let size = integer(operand).ok_or_else(|| MapperError::BadQuery("$size needs an integer".into()))?;
            values
                .iter()
                .any(|value| value.as_array().is_some_and(|items| items.len() as i64 == size))
        }
        "$mod" => {
            let parts = operand_array(op, operand)?;
            let (Some(divisor), Some(remainder)) = (
                parts.first().and_then(integer),
                parts.get(1).and_then(integer),
            ) else {
                return Err(MapperError::BadQuery("$mod needs [divisor, remainder]".into()));
            };
            if divisor == 0 {
                return Err(MapperError::BadQuery("$mod divisor cannot be 0".into()));
            }
            candidates(values)
                .iter()
                .filter_map(|candidate| integer(candidate))
                .any(|n| n % divisor == remainder)
        }
        "$within" | "$geoWithin" => {
            let shape = operand
                .as_document()
                .ok_or_else(|| MapperError::BadQuery(format!("{op} needs a shape document")))?;
            let mut inside = false;
            for point in values.iter().filter_map(|value| point(value)) {
                if geo::within(point, shape)? {
                    inside = true;
                    break;
                }
            }
            inside
        }
        "$near" | "$nearSphere" => {
            let origin = point(operand).ok_or_else(|| MapperError::BadQuery(format!("{op} needs a point")))?;
            let limit = siblings.get("$maxDistance").and_then(number);
            values.iter().filter_map(|value| point(value)).any(|target| {
                let distance = if op == "$near" {
                    geo::planar(origin, target)
                } else {
                    geo::spherical(origin, target)
                };
                limit.is_none_or(|limit| distance <= limit)
            })
        }
        other => return Err(MapperError::BadQuery(format!("unknown operator: {other}"))),
    })
}

fn any_of(values: &[&Bson], options: &[Bson]) -> MapperResult<bool> {
    for option in options {
        let matched = match option {
            Bson::RegularExpression(regex) => {
                matches_regex(values, &compile(regex.pattern.as_str(), regex.options.as_str())?)
            }
            literal => equals_any(values, literal),
        };
        if matched {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A legacy coordinate pair: `[x, y]` or a two-field document.
pub(crate) fn point(value: &Bson) -> Option<(f64, f64)> {
    let (x, y) = match value {
        Bson::Array(items) => (items.first()?, items.get(1)?),
        Bson::Document(document) => {
            let mut coordinates = document.values();
            (coordinates.next()?, coordinates.next()?)
        }
        _ => return None,
    };
    Some((number(x)?, number(y)?))
}

pub(crate) mod geo {
    use bson::{Bson, Document};

    use docmapper_core::error::{MapperError, MapperResult};

    use super::{number, point};

    pub(crate) fn planar(a: (f64, f64), b: (f64, f64)) -> f64 {
        ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
    }

    /// Great-circle angle in radians between two `(longitude, latitude)` points in degrees.
    pub(crate) fn spherical(a: (f64, f64), b: (f64, f64)) -> f64 {
        let (lon1, lat1) = (a.0.to_radians(), a.1.to_radians());
        let (lon2, lat2) = (b.0.to_radians(), b.1.to_radians());
        let h = ((lat2 - lat1) / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * ((lon2 - lon1) / 2.0).sin().powi(2);
        2.0 * h.sqrt().min(1.0).asin()
    }

    fn points(value: &Bson) -> Option<Vec<(f64, f64)>> {
        value.as_array()?.iter().map(point).collect()
    }

    fn shape_error(shape: &str) -> MapperError {
        MapperError::BadQuery(format!("malformed {shape} shape"))
    }

    pub(crate) fn within(target: (f64, f64), shape: &Document) -> MapperResult<bool> {
        if let Some(corners) = shape.get("$box") {
            let corners = points(corners).filter(|c| c.len() == 2).ok_or_else(|| shape_error("$box"))?;
            let (low_x, high_x) = (corners[0].0.min(corners[1].0), corners[0].0.max(corners[1].0));
            let (low_y, high_y) = (corners[0].1.min(corners[1].1), corners[0].1.max(corners[1].1));
            return Ok((low_x..=high_x).contains(&target.0) && (low_y..=high_y).contains(&target.1));
        }
        for (key, spherical_distance) in [("$center", false), ("$centerSphere", true)] {
            if let Some(circle) = shape.get(key) {
                let parts = circle.as_array().ok_or_else(|| shape_error(key))?;
                let center = parts.first().and_then(point).ok_or_else(|| shape_error(key))?;
                let radius = parts.get(1).and_then(number).ok_or_else(|| shape_error(key))?;
                let distance = if spherical_distance {
                    spherical(center, target)
                } else {
                    planar(center, target)
                };
                return Ok(distance <= radius);
            }
        }
        if let Some(polygon) = shape.get("$polygon") {
            let polygon = points(polygon).filter(|p| p.len() >= 3).ok_or_else(|| shape_error("$polygon"))?;
            return Ok(contains(&polygon, target));
        }
        Err(MapperError::BadQuery("unsupported geo shape".into()))
    }

    /// Even-odd ray casting.
    fn contains(polygon: &[(f64, f64)], (x, y): (f64, f64)) -> bool {
        let mut inside = false;
        let mut previous = polygon[polygon.len() - 1];
        for &current in polygon {
            if (current.1 > y) != (previous.1 > y)
                && x < (previous.0 - current.0) * (y - current.1) / (previous.1 - current.1) + current.0
            {
                inside = !inside;
            }
            previous = current;
        }
        inside
    }
}

/// Evaluates filter documents against one document.
pub(crate) struct DocumentEvaluator<'a> {
    document: &'a Document,
}

impl<'a> DocumentEvaluator<'a> {
    pub fn new(document: &'a Document) -> Self {
        Self { document }
    }

    pub fn evaluate(&self, filter: &Document) -> MapperResult<bool> {
        for (key, condition) in filter {
            let matched = match key.as_str() {
                "$and" => {
                    let mut all = true;
                    for clause in clauses(key, condition)? {
                        if !self.evaluate(clause)? {
                            all = false;
                            break;
                        }
                    }
                    all
                }
                "$or" | "$nor" => {
                    let mut any = false;
                    for clause in clauses(key, condition)? {
                        if self.evaluate(clause)? {
                            any = true;
                            break;
                        }
                    }
                    any == (key == "$or")
                }
                "$comment" => true,
                op if op.starts_with('$') => {
                    return Err(MapperError::BadQuery(format!("unknown top-level operator: {op}")));
                }
                path => matches_condition(&resolve(self.document, path), condition)?,
            };
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The documents of `documents` matching `filter`, in order.
    pub fn filter_documents<I>(documents: I, filter: &Document) -> MapperResult<Vec<Document>>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let mut matched = Vec::new();
        for document in documents {
            if DocumentEvaluator::new(document).evaluate(filter)? {
                matched.push(document.clone());
            }
        }
        Ok(matched)
    }
}

fn clauses<'a>(op: &str, condition: &'a Bson) -> MapperResult<Vec<&'a Document>> {
    let items = condition
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| MapperError::BadQuery(format!("{op} needs a non-empty array")))?;
    items
        .iter()
        .map(|item| {
            item.as_document()
                .ok_or_else(|| MapperError::BadQuery(format!("{op} entries must be documents")))
        })
        .collect()
}

// Sorting

fn descending(direction: &Bson) -> bool {
    number(direction).is_some_and(|n| n < 0.0)
}

fn sort_key<'a>(document: &'a Document, path: &str) -> &'a Bson {
    resolve(document, path).into_iter().next().unwrap_or(&NULL)
}

/// Stable multi-key sort. Missing values sort as null.
pub(crate) fn sort_documents(documents: &mut [Document], sort: &Document) {
    documents.sort_by(|a, b| {
        for (path, direction) in sort {
            let ordering = compare(sort_key(a, path), sort_key(b, path));
            let ordering = if descending(direction) { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// The path, origin and metric of a top-level proximity condition, which orders results
/// by distance when no explicit sort is given.
pub(crate) fn proximity(filter: &Document) -> Option<(String, (f64, f64), bool)> {
    filter.iter().find_map(|(path, condition)| {
        let operators = condition.as_document()?;
        if let Some(origin) = operators.get("$near").and_then(point) {
            return Some((path.clone(), origin, false));
        }
        let origin = operators.get("$nearSphere").and_then(point)?;
        Some((path.clone(), origin, true))
    })
}

pub(crate) fn sort_by_distance(documents: &mut [Document], path: &str, origin: (f64, f64), spherical: bool) {
    let distance = |document: &Document| {
        resolve(document, path)
            .into_iter()
            .find_map(point)
            .map(|target| if spherical { geo::spherical(origin, target) } else { geo::planar(origin, target) })
            .unwrap_or(f64::INFINITY)
    };
    documents.sort_by(|a, b| distance(a).partial_cmp(&distance(b)).unwrap_or(Ordering::Equal));
}

// Projection

fn is_inclusion(projection: &Document) -> bool {
    projection
        .iter()
        .filter(|(path, _)| path.as_str() != "_id")
        .any(|(_, spec)| !matches!(spec, Bson::Boolean(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) || truthy(spec))
}

/// Applies an inclusion or exclusion projection. Inclusion specs may also be
/// `{"$elemMatch": ...}`, `{"$slice": n}` or a `"$path"` string copying another field.
pub(crate) fn project(document: &Document, projection: &Document) -> MapperResult<Document> {
    if projection.is_empty() {
        return Ok(document.clone());
    }

    if !is_inclusion(projection) {
        let mut projected = document.clone();
        for (path, spec) in projection {
            if !truthy(spec) {
                exclude(&mut projected, &path.split('.').collect::<Vec<_>>());
            }
        }
        return Ok(projected);
    }

    let mut projected = Document::new();
    if projection.get("_id").is_none_or(truthy)
        && let Some(id) = document.get("_id")
    {
        projected.insert("_id", id.clone());
    }
    for (path, spec) in projection {
        if path == "_id" {
            continue;
        }
        match spec {
            Bson::Document(operator) if operator.contains_key("$elemMatch") => {
                let expression = operator
                    .get_document("$elemMatch")
                    .map_err(|_| MapperError::BadQuery("$elemMatch needs a document".into()))?;
                if let Some(Bson::Array(items)) = document.get(path) {
                    for item in items {
                        if element_matches(item, expression)? {
                            projected.insert(path.clone(), Bson::Array(vec![item.clone()]));
                            break;
                        }
                    }
                }
            }
            Bson::Document(operator) if operator.contains_key("$slice") => {
                if let Some(Bson::Array(items)) = document.get(path) {
                    let sliced = slice(items, operator.get("$slice").unwrap_or(&NULL))?;
                    projected.insert(path.clone(), Bson::Array(sliced));
                }
            }
            Bson::String(source) if source.starts_with('$') => {
                let value = resolve(document, &source[1..]).into_iter().next().cloned();
                if let Some(value) = value {
                    projected.insert(path.clone(), value);
                }
            }
            spec if truthy(spec) => include(document, &path.split('.').collect::<Vec<_>>(), &mut projected),
            _ => {}
        }
    }
    Ok(projected)
}

fn slice(items: &[Bson], spec: &Bson) -> MapperResult<Vec<Bson>> {
    let len = items.len() as i64;
    let (start, count) = match spec {
        Bson::Array(parts) => {
            let skip = parts.first().and_then(integer).unwrap_or_default();
            let count = parts.get(1).and_then(integer).unwrap_or(len);
            let start = if skip < 0 { (len + skip).max(0) } else { skip.min(len) };
            (start, count)
        }
        other => match integer(other) {
            Some(n) if n < 0 => ((len + n).max(0), -n),
            Some(n) => (0, n),
            None => return Err(MapperError::BadQuery("$slice needs an integer".into())),
        },
    };
    Ok(items
        .iter()
        .skip(start as usize)
        .take(count.max(0) as usize)
        .cloned()
        .collect())
}

fn include(source: &Document, segments: &[&str], target: &mut Document) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Some(value) = source.get(*head) else {
        return;
    };
    if rest.is_empty() {
        target.insert(*head, value.clone());
        return;
    }
    match value {
        Bson::Document(child) => {
            let slot = target
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            if let Bson::Document(child_target) = slot {
                include(child, rest, child_target);
            }
        }
        Bson::Array(items) => {
            let projected: Vec<Bson> = items
                .iter()
                .filter_map(Bson::as_document)
                .map(|child| {
                    let mut child_target = Document::new();
                    include(child, rest, &mut child_target);
                    Bson::Document(child_target)
                })
                .collect();
            target.insert(*head, projected);
        }
        _ => {}
    }
}

fn exclude(document: &mut Document, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        document.remove(*head);
        return;
    }
    match document.get_mut(*head) {
        Some(Bson::Document(child)) => exclude(child, rest),
        Some(Bson::Array(items)) => {
            for item in items {
                if let Bson::Document(child) = item {
                    exclude(child, rest);
                }
            }
        }
        _ => {}
    }
}
