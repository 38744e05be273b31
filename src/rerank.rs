//! Result reranking via an external subprocess.
//!
//! The hybrid search pipeline optionally hands its merged candidate list to
//! a [`Reranker`]. The bundled implementation invokes a configured command
//! (typically a small LLM CLI) with a prompt listing the query and numbered
//! candidate snippets, and expects a JSON integer array on stdout giving the
//! preferred order.
//!
//! Reranking is strictly best-effort: on timeout, parse failure, missing
//! binary, or nonsense indices the original ordering is returned unchanged.

use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use crate::search::SearchResult;

/// Snippet length offered to the reranker per candidate.
const RERANK_SNIPPET_CHARS: usize = 300;

/// Reorders candidates for a query. Implementations MUST return every input
/// candidate exactly once.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: Vec<SearchResult>) -> Vec<SearchResult>;
}

/// Reranker that shells out to an external command.
///
/// The prompt is appended as the final argument; stdout is scanned for the
/// first JSON integer array.
pub struct CommandReranker {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandReranker {
    pub fn new(command: String, args: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            command,
            args,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn build_prompt(query: &str, candidates: &[SearchResult]) -> String {
        let mut prompt = String::from(
            "Rank the following memory snippets by relevance to the query. \
             Reply with only a JSON array of candidate indices, best first.\n\n",
        );
        prompt.push_str(&format!("Query: {}\n\n", query));
        for (i, c) in candidates.iter().enumerate() {
            let snippet: String = c.snippet.chars().take(RERANK_SNIPPET_CHARS).collect();
            prompt.push_str(&format!("[{}] ({}) {}\n", i, c.path, snippet));
        }
        prompt
    }

    async fn invoke(&self, prompt: &str) -> Option<String> {
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args)
            .arg(prompt)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(command = %self.command, error = %e, "reranker spawn failed");
                return None;
            }
            Err(_) => {
                warn!(command = %self.command, "reranker timed out");
                return None;
            }
        };

        if !output.status.success() {
            warn!(
                command = %self.command,
                status = %output.status,
                "reranker exited nonzero"
            );
            return None;
        }

        Some(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Reranker for CommandReranker {
    async fn rerank(&self, query: &str, candidates: Vec<SearchResult>) -> Vec<SearchResult> {
        if candidates.len() < 2 {
            return candidates;
        }

        let prompt = Self::build_prompt(query, &candidates);
        let Some(stdout) = self.invoke(&prompt).await else {
            return candidates;
        };

        match parse_index_array(&stdout) {
            Some(indices) => apply_order(candidates, &indices),
            None => {
                warn!(command = %self.command, "reranker output had no index array");
                candidates
            }
        }
    }
}

/// Extract the first JSON integer array from free-form output.
fn parse_index_array(output: &str) -> Option<Vec<usize>> {
    let start = output.find('[')?;
    let end = output[start..].find(']')? + start;
    let slice = &output[start..=end];
    serde_json::from_str::<Vec<usize>>(slice).ok()
}

/// Apply a preference order to `candidates`.
///
/// Out-of-range and duplicate indices are ignored; candidates the order
/// omitted are appended afterwards in their original position.
fn apply_order(candidates: Vec<SearchResult>, indices: &[usize]) -> Vec<SearchResult> {
    let mut taken = vec![false; candidates.len()];
    let mut order = Vec::with_capacity(candidates.len());

    for &i in indices {
        if i < candidates.len() && !taken[i] {
            taken[i] = true;
            order.push(i);
        }
    }
    for i in 0..candidates.len() {
        if !taken[i] {
            order.push(i);
        }
    }

    let mut slots: Vec<Option<SearchResult>> = candidates.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(path: &str) -> SearchResult {
        SearchResult {
            path: path.to_string(),
            start_line: 1,
            end_line: 1,
            score: 1.0,
            snippet: format!("snippet for {}", path),
        }
    }

    #[test]
    fn test_apply_order_basic() {
        let candidates = vec![result("a"), result("b"), result("c")];
        let reordered = apply_order(candidates, &[2, 0, 1]);
        let paths: Vec<&str> = reordered.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_apply_order_ignores_bad_indices() {
        let candidates = vec![result("a"), result("b"), result("c")];
        let reordered = apply_order(candidates, &[9, 1, 1, 0]);
        let paths: Vec<&str> = reordered.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_apply_order_appends_omitted() {
        let candidates = vec![result("a"), result("b"), result("c"), result("d")];
        let reordered = apply_order(candidates, &[3]);
        let paths: Vec<&str> = reordered.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["d", "a", "b", "c"]);
    }

    #[test]
    fn test_parse_index_array() {
        assert_eq!(
            parse_index_array("ranked: [2, 0, 1] done"),
            Some(vec![2, 0, 1])
        );
        assert_eq!(parse_index_array("[]"), Some(vec![]));
        assert_eq!(parse_index_array("no array here"), None);
        assert_eq!(parse_index_array("[\"a\", \"b\"]"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_returns_original_order() {
        let reranker = CommandReranker::new(
            "definitely-not-a-real-binary-7f3a".to_string(),
            vec![],
            1,
        );
        let candidates = vec![result("a"), result("b")];
        let out = reranker.rerank("query", candidates.clone()).await;
        let paths: Vec<&str> = out.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_single_candidate_skips_subprocess() {
        let reranker = CommandReranker::new("nonexistent".to_string(), vec![], 1);
        let out = reranker.rerank("q", vec![result("only")]).await;
        assert_eq!(out.len(), 1);
    }
}
