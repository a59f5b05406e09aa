//! Reference node logic: an external sort expressed as a workflow.
//!
//! `split` cuts a file of integers (one per line) into parts, every `sort`
//! node sorts one part, and `merge` nodes combine sorted files in groups until
//! a single file remains.

use crate::error::BuildError;
use crate::substrate::{Job, JobContext, LocalSubstrate, ResultContext};
use crate::workflow::{InputSpec, NodeSpec, WorkflowBuilder, WorkflowDefinition};
use anyhow::{Context, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SPLIT_KIND: &str = "split";
pub const SORT_KIND: &str = "sort";
pub const MERGE_KIND: &str = "merge";

/// Exposed name of the fully sorted file
pub const RESULT_OUTPUT: &str = "result";

const SORTED_FILE: &str = "sorted.txt";
const MERGED_FILE: &str = "merged.txt";

/// Register split/sort/merge under their job kinds
pub fn register_sort_jobs(substrate: &LocalSubstrate) {
    substrate.register(SPLIT_KIND, Arc::new(SplitJob));
    substrate.register(SORT_KIND, Arc::new(SortJob));
    substrate.register(MERGE_KIND, Arc::new(MergeJob));
}

pub fn part_file(index: usize) -> String {
    format!("part-{:04}.txt", index)
}

/// Splits its single input into `parts` contiguous chunks
pub struct SplitJob;

#[async_trait::async_trait]
impl Job for SplitJob {
    async fn run(&self, ctx: JobContext) -> Result<ResultContext> {
        let parts = usize::try_from(ctx.param_i64("parts")?)
            .ok()
            .filter(|p| *p > 0)
            .context("Parameter 'parts' must be positive")?;
        let input = match ctx.inputs.as_slice() {
            [input] => input,
            other => anyhow::bail!("split expects exactly one input, got {}", other.len()),
        };

        let values = read_values(input).await?;
        tracing::debug!("Splitting {} values into {} parts: node={}", values.len(), parts, ctx.identity);

        for index in 0..parts {
            let start = index * values.len() / parts;
            let end = (index + 1) * values.len() / parts;
            write_values(&ctx.work_dir.join(part_file(index)), &values[start..end]).await?;
        }

        Ok(ResultContext::output_dir(&ctx.work_dir))
    }
}

/// Sorts the union of its inputs numerically
pub struct SortJob;

#[async_trait::async_trait]
impl Job for SortJob {
    async fn run(&self, ctx: JobContext) -> Result<ResultContext> {
        let mut values = Vec::new();
        for input in &ctx.inputs {
            values.extend(read_values(input).await?);
        }
        values.sort_unstable();
        write_values(&ctx.work_dir.join(SORTED_FILE), &values).await?;
        Ok(ResultContext::output_dir(&ctx.work_dir))
    }
}

/// K-way merge of already sorted inputs
pub struct MergeJob;

#[async_trait::async_trait]
impl Job for MergeJob {
    async fn run(&self, ctx: JobContext) -> Result<ResultContext> {
        let mut runs = Vec::with_capacity(ctx.inputs.len());
        for input in &ctx.inputs {
            runs.push(read_values(input).await?);
        }

        let total = runs.iter().map(Vec::len).sum();
        let mut merged = Vec::with_capacity(total);
        let mut heap: BinaryHeap<Reverse<(i64, usize, usize)>> = runs
            .iter()
            .enumerate()
            .filter_map(|(run, values)| values.first().map(|v| Reverse((*v, run, 0))))
            .collect();

        while let Some(Reverse((value, run, pos))) = heap.pop() {
            merged.push(value);
            if let Some(next) = runs[run].get(pos + 1) {
                heap.push(Reverse((*next, run, pos + 1)));
            }
        }

        write_values(&ctx.work_dir.join(MERGED_FILE), &merged).await?;
        Ok(ResultContext::output_dir(&ctx.work_dir))
    }
}

/// Build the split/sort/merge workflow for `input`.
///
/// Sorted parts are merged `group` at a time, level by level, and the last
/// file is exposed as [`RESULT_OUTPUT`].
pub fn sort_workflow(
    data_dir: impl Into<PathBuf>,
    input: impl Into<PathBuf>,
    parts: usize,
    group: usize,
) -> Result<WorkflowDefinition, BuildError> {
    let parts = parts.max(1);
    let group = group.max(2);
    let mut builder = WorkflowBuilder::new(data_dir);

    builder.add_node(
        NodeSpec::new("split", SPLIT_KIND)
            .param("parts", parts as i64)
            .input(InputSpec::path(input))
            .outputs((0..parts).map(part_file)),
    );

    let mut level: Vec<(String, &str)> = Vec::with_capacity(parts);
    for index in 0..parts {
        let name = format!("sort-{:04}", index);
        builder.add_node(
            NodeSpec::new(name.clone(), SORT_KIND)
                .input(InputSpec::output("split", part_file(index)))
                .output(SORTED_FILE),
        );
        level.push((name, SORTED_FILE));
    }

    let mut depth = 0;
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(group));
        for (index, chunk) in level.chunks(group).enumerate() {
            let name = format!("merge-{}-{:04}", depth, index);
            builder.add_node(
                NodeSpec::new(name.clone(), MERGE_KIND)
                    .inputs(chunk.iter().map(|(producer, _)| InputSpec::output(producer.clone(), "*.txt")))
                    .output(MERGED_FILE),
            );
            next.push((name, MERGED_FILE));
        }
        level = next;
        depth += 1;
    }

    if let Some((last, file)) = level.pop() {
        builder.add_final_output(RESULT_OUTPUT, last, file);
    }
    builder.build()
}

async fn read_values(path: &Path) -> Result<Vec<i64>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<i64>()
                .with_context(|| format!("Invalid integer '{}' in {}", line, path.display()))
        })
        .collect()
}

async fn write_values(path: &Path, values: &[i64]) -> Result<()> {
    let mut text = String::with_capacity(values.len() * 8);
    for value in values {
        text.push_str(&value.to_string());
        text.push('\n');
    }
    tokio::fs::write(path, text)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}
