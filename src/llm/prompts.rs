//! LLM prompts for indexing, node selection and answer synthesis.
//!
//! Templates use `{placeholder}` markers filled with `str::replace`.

use super::ResponseSchema;

/// Collection of prompts used for tree summarization and retrieval.
pub struct Prompts;

impl Prompts {
    /// System prompt for general document analysis.
    pub fn system_document_analyzer() -> &'static str {
        "You are an expert document analyzer. You help summarize sections, navigate document structure, and answer questions about documents. Always respond with valid JSON when requested."
    }

    /// Prompt to generate a summary for one tree node.
    pub fn node_summary() -> &'static str {
        r#"You are given a section from a document. Generate a concise summary (2-3 sentences) describing the main topics and key information covered in this section.
{context}
Section Title: {title}

Section Content:
{content}

Provide ONLY the summary text, nothing else. Be specific about what information this section contains that would help someone searching for relevant content."#
    }

    /// Stricter retry prompt after an empty or unusable summary.
    pub fn node_summary_strict() -> &'static str {
        r#"Your previous answer was not a usable summary. Write 1-3 plain English sentences summarizing the section below.
Rules: no JSON, no markdown, no bullet points, no preamble, no quotes. Output the sentences only.
{context}
Section Title: {title}

Section Content:
{content}"#
    }

    /// Context block for a node whose parent is already summarized.
    pub fn parent_context() -> &'static str {
        "\nThis section belongs to a larger section summarized as: {summary}\n"
    }

    /// Context block for a node whose children are already summarized.
    pub fn children_context() -> &'static str {
        "\nThis section contains subsections summarized as:\n{summaries}\n"
    }

    /// Prompt to choose relevant nodes from a flattened tree listing.
    pub fn select_nodes() -> &'static str {
        r#"You are an expert at navigating hierarchical document structures to find relevant information.

You are given a query and the outline of one document. Each line is "node_id — title — summary"; indentation shows nesting.

Document: {doc_name}

Document sections:
{listing}

User query: {query}

Select at most {top_k} sections most likely to contain information that answers the query, most relevant first. Select fewer, or none, if few are relevant.

Reply in JSON format:
{
    "nodes": [
        {"node_id": "<node_id from the outline>", "relevance_score": <number between 0 and 1>},
        ...
    ]
}
Directly return the final JSON structure. Do not output anything else."#
    }

    /// Retry prompt when the selection reply failed to parse.
    pub fn reformat_selection() -> &'static str {
        r#"Your previous reply could not be parsed: {error}

Previous reply:
{previous}

Rewrite it as exactly this JSON shape, with at most {top_k} entries, node ids copied verbatim from the outline and relevance_score between 0 and 1:
{"nodes": [{"node_id": "0001", "relevance_score": 0.9}]}

Return only the JSON object. No prose, no markdown fences."#
    }

    /// Schema for the node-selection reply.
    pub fn selection_schema() -> ResponseSchema {
        ResponseSchema::new(
            "node_selection",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "nodes": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "node_id": {"type": "string"},
                                "relevance_score": {"type": "number", "minimum": 0, "maximum": 1}
                            },
                            "required": ["node_id", "relevance_score"]
                        }
                    }
                },
                "required": ["nodes"]
            }),
        )
    }

    /// System prompt for grounded answer synthesis.
    pub fn answer_system() -> &'static str {
        r#"You are a helpful assistant that answers questions based on provided document excerpts.
Use only the information from the provided context to answer the question.
If the context doesn't contain enough information to answer the question, say so explicitly.
Be concise and accurate in your response."#
    }

    /// Prompt carrying the question and the assembled context.
    pub fn answer() -> &'static str {
        r#"Question: {query}

Context:
{context}

Please answer the question based only on the context above."#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_are_not_empty() {
        assert!(!Prompts::system_document_analyzer().is_empty());
        assert!(!Prompts::node_summary().is_empty());
        assert!(!Prompts::node_summary_strict().is_empty());
        assert!(!Prompts::select_nodes().is_empty());
        assert!(!Prompts::reformat_selection().is_empty());
        assert!(!Prompts::answer().is_empty());
    }

    #[test]
    fn test_templates_carry_placeholders() {
        for placeholder in ["{title}", "{content}", "{context}"] {
            assert!(Prompts::node_summary().contains(placeholder));
            assert!(Prompts::node_summary_strict().contains(placeholder));
        }
        for placeholder in ["{listing}", "{query}", "{top_k}", "{doc_name}"] {
            assert!(Prompts::select_nodes().contains(placeholder));
        }
        assert!(Prompts::answer().contains("{context}"));
    }

    #[test]
    fn test_selection_schema_requires_nodes() {
        let schema = Prompts::selection_schema();
        assert_eq!(schema.name, "node_selection");
        assert_eq!(schema.schema["required"][0], "nodes");
    }
}
