//! Routing benchmarks.
//!
//! Rule matching runs once per connection and node selection once per
//! PROXY connection, both as linear scans.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use noderelay::node::{Node, NodeDescriptor};
use noderelay::rules::RuleSet;
use noderelay::selector::{select, Constraint};

fn rule_set(size: usize) -> RuleSet {
    let mut lines: Vec<String> = (0..size)
        .map(|i| match i % 3 {
            0 => format!("DOMAIN-SUFFIX,site{}.example,Proxy", i),
            1 => format!("DOMAIN-KEYWORD,keyword{},DIRECT", i),
            _ => format!("DOMAIN,host{}.example,REJECT", i),
        })
        .collect();
    lines.push("MATCH,DIRECT".to_string());
    RuleSet::parse(&lines).unwrap()
}

fn node_pool(size: usize) -> Vec<Arc<Node>> {
    let regions = ["香港", "日本", "美国", "新加坡"];
    (0..size)
        .map(|i| {
            let name = format!("{} {:02}", regions[i % regions.len()], i);
            let node = Node::from_descriptor(&NodeDescriptor::new(
                name,
                "127.0.0.1",
                8388,
                "aes-128-gcm",
                "bench",
            ))
            .unwrap();
            if i % 5 == 0 {
                node.record_probe_failure();
            } else {
                node.record_success(Duration::from_millis(20 + (i as u64 * 7) % 300));
            }
            Arc::new(node)
        })
        .collect()
}

fn bench_rule_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("rule_match");

    for size in [10, 100, 1000] {
        let rules = rule_set(size);
        group.bench_with_input(BenchmarkId::new("fallthrough", size), &rules, |b, rules| {
            b.iter(|| black_box(rules.match_host("unmatched.example.org")))
        });
        group.bench_with_input(BenchmarkId::new("suffix_hit", size), &rules, |b, rules| {
            b.iter(|| black_box(rules.match_host("www.site0.example")))
        });
    }

    group.finish();
}

fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("select");
    let hk = Constraint::region("HK");

    for size in [10, 100, 500] {
        let nodes = node_pool(size);
        group.bench_with_input(BenchmarkId::new("unconstrained", size), &nodes, |b, nodes| {
            b.iter(|| black_box(select(nodes, None).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("region", size), &nodes, |b, nodes| {
            b.iter(|| black_box(select(nodes, Some(&hk)).ok()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_rule_match, bench_select);
criterion_main!(benches);
