//! End-to-end: Markdown → outline → indexed tree on disk → restored → searched.

use std::sync::Arc;
use tempfile::TempDir;
use tree_knowledge_base::llm::{OfflineModel, ScriptedModel};
use tree_knowledge_base::outline::from_markdown;
use tree_knowledge_base::retrieval::NO_RELEVANT_CONTENT;
use tree_knowledge_base::tree::SummarySource;
use tree_knowledge_base::tree_search::{find_node, flatten, path_to, unflatten};
use tree_knowledge_base::{
    Document, DocumentManager, DocumentState, FileStore, KnowledgeBaseError, ResolutionMethod,
    SaveFormat, SearchRequest,
};

const HANDBOOK: &str = "\
Welcome to the handbook.

# Getting Started
Install the tool with the package manager.
## Configuration
Settings live in a YAML file under the config directory.
## First Run
Run the index command on a Markdown file.
# Troubleshooting
Most problems come from a missing API key.
## Network Errors
Retry after checking the proxy settings.";

fn summarizer() -> ScriptedModel {
    ScriptedModel::new(|prompt| {
        if prompt.contains("Document sections:") {
            Ok(r#"{"nodes": [{"node_id": "0006", "relevance_score": 0.9}, {"node_id": "0005", "relevance_score": 0.6}]}"#.into())
        } else if prompt.starts_with("Question:") {
            Ok("Check the proxy settings and retry.".into())
        } else {
            let title = prompt
                .lines()
                .find_map(|l| l.strip_prefix("Section Title: "))
                .unwrap_or("this part");
            Ok(format!("Explains {} for new users.", title))
        }
    })
}

#[test]
fn test_index_persist_restore_search() {
    let dir = TempDir::new().unwrap();
    let document = Document::from_text("handbook", HANDBOOK);
    let outline = from_markdown(HANDBOOK);

    tokio_test::block_on(async {
        let store = Arc::new(FileStore::new(dir.path(), SaveFormat::Json));
        let manager = DocumentManager::new(Arc::new(summarizer()), store);

        let tree = manager
            .index("handbook", &outline, &document, None)
            .await
            .unwrap();

        // preamble, two chapters, three subsections
        assert_eq!(tree.node_count(), 6);
        assert_eq!(tree.max_depth(), 2);
        assert_eq!(tree.nodes[0].title, "");
        let network = find_node(&tree, "0005").unwrap();
        assert_eq!(network.title, "Network Errors");
        assert_eq!(network.summary.as_deref(), Some("Explains Network Errors for new users."));
        assert_eq!(network.summary_source, SummarySource::Generated);

        let path: Vec<&str> = path_to(&tree, "0005").iter().map(|n| n.title.as_str()).collect();
        assert_eq!(path, vec!["Troubleshooting", "Network Errors"]);

        // flatten + unflatten recovers the hierarchy
        let pairs = flatten(&tree)
            .into_iter()
            .map(|f| (f.depth, f.node.detached()))
            .collect::<Vec<_>>();
        assert_eq!(unflatten(pairs).unwrap(), tree.nodes);
    });

    assert!(dir.path().join("trees").join("handbook.json").exists());
    assert!(dir.path().join("status").join("handbook.json").exists());

    tokio_test::block_on(async {
        let store = Arc::new(FileStore::new(dir.path(), SaveFormat::Json));
        let manager = DocumentManager::new(Arc::new(summarizer()), store);
        assert_eq!(manager.restore().await.unwrap(), 1);
        assert_eq!(manager.state("handbook").unwrap(), DocumentState::Ready);

        let response = manager
            .search(&SearchRequest::new("network errors behind a proxy"), None)
            .await
            .unwrap();

        // 0006 does not exist in this tree; only 0005 survives validation
        assert_eq!(response.results.len(), 1);
        let hit = &response.results[0];
        assert_eq!(hit.node_id, "0005");
        assert_eq!(hit.depth, 1);
        assert_eq!(hit.content, "## Network Errors\nRetry after checking the proxy settings.");
        assert_eq!(hit.scoring_method, ResolutionMethod::Structured);
        assert_eq!(response.answer.as_deref(), Some("Check the proxy settings and retry."));
    });
}

#[test]
fn test_offline_pipeline_uses_deterministic_fallbacks() {
    tokio_test::block_on(async {
        let store = Arc::new(tree_knowledge_base::MemoryStore::new());
        let manager = DocumentManager::new(Arc::new(OfflineModel), store);
        let document = Document::from_text("handbook", HANDBOOK);

        let tree = manager
            .index("handbook", &from_markdown(HANDBOOK), &document, None)
            .await
            .unwrap();
        let config = find_node(&tree, "0002").unwrap();
        assert_eq!(config.summary_source, SummarySource::Extractive);
        assert!(config.summary.as_deref().unwrap().contains("YAML file"));

        let response = manager
            .search(&SearchRequest::new("yaml settings"), None)
            .await
            .unwrap();
        assert_eq!(response.results[0].node_id, "0002");
        assert_eq!(response.results[0].scoring_method, ResolutionMethod::Fallback);
        // the answer call fails offline, results are still returned
        assert!(response.answer.is_none());

        let response = manager
            .search(&SearchRequest::new("kubernetes"), None)
            .await
            .unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.answer.as_deref(), Some(NO_RELEVANT_CONTENT));

        let no_documents: Vec<String> = Vec::new();
        let result = manager
            .search(&SearchRequest::new("anything"), Some(no_documents.as_slice()))
            .await;
        assert!(matches!(result, Err(KnowledgeBaseError::NoCandidates)));
    });
}
