//! Aggregation pipeline builder.

use std::sync::Arc;

use bson::{Bson, Document, doc};

use crate::{
    error::MapperResult,
    query::{Query, QueryExpression},
    schema::{DocumentSchema, SortOrder},
};

/// An ordered list of pipeline stages over one collection.
#[derive(Debug, Clone)]
pub struct Aggregation {
    collection: String,
    schema: Option<Arc<DocumentSchema>>,
    pipeline: Vec<Document>,
}

impl Aggregation {
    /// A pipeline over `schema`'s collection, restricted to the schema and its subtypes.
    pub fn new(schema: &Arc<DocumentSchema>) -> Self {
        let mut aggregation = Self {
            collection: schema.collection().to_string(),
            schema: Some(Arc::clone(schema)),
            pipeline: Vec::new(),
        };
        let base = schema.base_query(false);
        if !base.is_empty() {
            aggregation.pipeline.push(doc! { "$match": base });
        }
        aggregation
    }

    /// A schema-less pipeline over `collection`.
    pub fn on_collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            schema: None,
            pipeline: Vec::new(),
        }
    }

    /// Translates a query into `$match`, `$project`, `$sort`, `$skip` and `$limit` stages.
    pub fn from_query(query: &Query) -> MapperResult<Self> {
        let mut aggregation = Self {
            collection: query.collection().to_string(),
            schema: Some(Arc::clone(query.schema())),
            pipeline: Vec::new(),
        };
        if !query.filter_document().is_empty() {
            aggregation = aggregation.match_doc(query.filter_document().clone());
        }
        if let Some(projection) = query.projection() {
            aggregation = aggregation.project(projection);
        }
        if let Some(sort) = query.sort_document()? {
            aggregation = aggregation.stage(doc! { "$sort": sort });
        }
        if let Some(skip) = query.skip_value() {
            aggregation = aggregation.skip(skip);
        }
        if let Some(limit) = query.limit_value() {
            aggregation = aggregation.limit(limit);
        }
        Ok(aggregation)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn schema(&self) -> Option<&Arc<DocumentSchema>> {
        self.schema.as_ref()
    }

    pub fn match_(self, expression: impl Into<QueryExpression>) -> Self {
        self.match_doc(expression.into().into_document())
    }

    pub fn match_doc(self, filter: Document) -> Self {
        self.stage(doc! { "$match": filter })
    }

    pub fn project(self, projection: Document) -> Self {
        self.stage(doc! { "$project": projection })
    }

    /// Appends a `$sort` stage over wire paths.
    pub fn sort<'a, I>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, SortOrder)>,
    {
        let mut sort = Document::new();
        for (path, order) in keys {
            sort.insert(path, order.as_i32());
        }
        self.stage(doc! { "$sort": sort })
    }

    pub fn skip(self, skip: u64) -> Self {
        self.stage(doc! { "$skip": Bson::Int64(skip as i64) })
    }

    pub fn limit(self, limit: i64) -> Self {
        self.stage(doc! { "$limit": limit })
    }

    /// Left outer join of `from` documents whose `foreign_field` equals `local_field`.
    pub fn lookup(self, from: &str, local_field: &str, foreign_field: &str, as_field: &str) -> Self {
        self.stage(doc! {
            "$lookup": {
                "from": from,
                "localField": local_field,
                "foreignField": foreign_field,
                "as": as_field,
            }
        })
    }

    pub fn unwind(self, path: &str) -> Self {
        self.stage(doc! { "$unwind": format!("${path}") })
    }

    /// Appends a stage verbatim.
    pub fn stage(mut self, stage: Document) -> Self {
        self.pipeline.push(stage);
        self
    }

    pub fn pipeline(&self) -> &[Document] {
        &self.pipeline
    }

    pub fn into_pipeline(self) -> Vec<Document> {
        self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDescriptor;

    #[test]
    fn query_stages_are_emitted_in_order() {
        let schema = DocumentSchema::builder("AggregationItem")
            .field(FieldDescriptor::string("name"))
            .field(FieldDescriptor::int("rank").with_wire_name("r"))
            .build()
            .unwrap();
        let rank = schema.field_path("rank").unwrap();
        let query = Query::new(&schema)
            .filter(rank.gt(1).unwrap())
            .unwrap()
            .fields(["name"])
            .unwrap()
            .descending("rank")
            .unwrap()
            .skip(2)
            .limit(5);

        let pipeline = Aggregation::from_query(&query).unwrap().into_pipeline();
        assert_eq!(
            pipeline,
            vec![
                doc! { "$match": { "r": { "$gt": 1_i64 } } },
                doc! { "$project": { "name": true, "_id": true } },
                doc! { "$sort": { "r": -1 } },
                doc! { "$skip": 2_i64 },
                doc! { "$limit": 5_i64 },
            ]
        );
    }

    #[test]
    fn lookup_and_raw_stages_append() {
        let pipeline = Aggregation::on_collection("orders")
            .lookup("customers", "customer", "_id", "customer_doc")
            .unwind("customer_doc")
            .into_pipeline();

        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline[1], doc! { "$unwind": "$customer_doc" });
    }
}
