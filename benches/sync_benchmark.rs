//! Benchmarks for marketsync normalization.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use marketsync::cursor::PagingConfig;
use marketsync::http::{HttpMethod, RequestTemplate};
use marketsync::normalize::{FieldValue, Normalizer};
use marketsync::schema::{ChildSource, EntityGraph, EntityNode, FieldSpec, FieldType};
use serde_json::json;

fn offer_graph() -> EntityGraph {
    EntityGraph {
        name: "offers".into(),
        enabled: true,
        request: RequestTemplate::new(HttpMethod::Get, "/v1/offers"),
        paging: PagingConfig::default(),
        root: "offers".into(),
        nodes: vec![
            EntityNode::new("offers", "{merchant_id}-{offer_id}")
                .field(FieldSpec::new("merchant_id", FieldType::Text).required(true))
                .field(FieldSpec::new("offer_id", FieldType::Text).required(true))
                .field(FieldSpec::new(
                    "/price/amount",
                    FieldType::Decimal {
                        precision: 18,
                        scale: 4,
                    },
                ))
                .field(FieldSpec::new("status", FieldType::Text))
                .child(
                    "offer_outlets",
                    ChildSource::Collection {
                        path: "/outlets".into(),
                    },
                ),
            EntityNode::new("offer_outlets", "{parent.key}-{outlet_id}")
                .field(FieldSpec::new("outlet_id", FieldType::Text).required(true))
                .field(FieldSpec::new("stock", FieldType::Integer).nullable(false)),
        ],
    }
}

fn offer_doc() -> serde_json::Value {
    json!({
        "merchant_id": "m1",
        "offer_id": "o1",
        "price": {"amount": "19.90", "currency": "EUR"},
        "status": "active",
        "outlets": [
            {"outlet_id": "u1", "stock": 4},
            {"outlet_id": "u2", "stock": 0},
            {"outlet_id": "u3"},
        ],
    })
}

/// Benchmark normalizing a nested document into a record tree.
fn bench_normalize(c: &mut Criterion) {
    let graph = offer_graph();
    let normalizer = Normalizer::new(&graph);
    let doc = offer_doc();

    c.bench_function("normalize_offer_document", |b| {
        b.iter(|| black_box(normalizer.normalize(black_box(&doc)).unwrap()))
    });
}

/// Benchmark typed value coercion.
fn bench_coerce(c: &mut Criterion) {
    let decimal_type = FieldType::Decimal {
        precision: 18,
        scale: 4,
    };
    let price = json!("19.90");

    c.bench_function("coerce_decimal", |b| {
        b.iter(|| black_box(FieldValue::coerce(black_box(&price), &decimal_type).unwrap()))
    });
}

criterion_group!(benches, bench_normalize, bench_coerce);
criterion_main!(benches);
