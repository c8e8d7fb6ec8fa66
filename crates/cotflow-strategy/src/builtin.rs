//! Built-in three phase pipeline: research, concepts, drafts.
//!
//! Prompts are deliberately domain neutral. Session config supplies `topic`
//! and any other variables the prompts name; unknown variables stay literal.

use crate::model::{AdapterRule, ExecuteBehavior, FanOut, PhaseStrategy, StepSpec};

const JSON_ONLY: &str = "Respond with a single JSON object and nothing else.";

const RESEARCH_THINK: &str = "\
You are planning research on the topic: {topic}.
Session settings: {session_config}

Propose up to five focused web search queries that would surface current,
verifiable developments on this topic.
Return JSON: {\"queries\": [{\"query\": \"...\", \"intent\": \"...\"}]}";

const RESEARCH_INTEGRATE: &str = "\
Topic: {topic}
Planned queries: {queries}
Search results: {searchResults}

Synthesize the results into the most promising trends. Cite the sources
you relied on.
Return JSON: {\"trendedTopics\": [{\"title\": \"...\", \"summary\": \"...\", \"sources\": [\"...\"]}]}";

const CONCEPTS_THINK: &str = "\
Topic: {topic}
Opportunities found in research: {opportunities}

Evaluate each opportunity for relevance and novelty and pick the strongest.
Return JSON: {\"evaluation\": [{\"title\": \"...\", \"score\": 0, \"reason\": \"...\"}]}";

const CONCEPTS_INTEGRATE: &str = "\
Opportunities: {opportunities}
Evaluation: {evaluation}

Turn the top opportunities into distinct concepts.
Return JSON: {\"concepts\": [{\"title\": \"...\", \"angle\": \"...\", \"keyPoints\": [\"...\"]}]}";

const DRAFTS_THINK: &str = "\
Concepts: {concepts}

Outline how each concept should be presented.
Return JSON: {\"outlines\": [{\"concept\": \"...\", \"structure\": [\"...\"]}]}";

const DRAFTS_INTEGRATE: &str = "\
Concepts: {concepts}
Outlines: {outlines}

Write one draft per concept following its outline.
Return JSON: {\"drafts\": [{\"concept\": \"...\", \"body\": \"...\"}]}";

const SEARCH_SYSTEM: &str = "\
You are a research assistant investigating {topic}. Answer with concrete,
recent facts and include source URLs.";

pub(crate) fn phases() -> Vec<PhaseStrategy> {
    let mut fan_out = FanOut::new("queries", "query");
    fan_out.system_instruction = Some(SEARCH_SYSTEM.to_string());
    fan_out.max_queries = Some(5);

    vec![
        PhaseStrategy {
            phase: 1,
            name: "research".to_string(),
            think: StepSpec::new(RESEARCH_THINK)
                .with_system(JSON_ONLY)
                .with_params(0.7, 2000)
                .requiring(&["topic"]),
            execute: ExecuteBehavior::SearchFanOut(fan_out),
            integrate: StepSpec::new(RESEARCH_INTEGRATE)
                .with_system(JSON_ONLY)
                .with_params(0.5, 4000),
        },
        PhaseStrategy {
            phase: 2,
            name: "concepts".to_string(),
            think: StepSpec::new(CONCEPTS_THINK)
                .with_system(JSON_ONLY)
                .with_params(0.7, 3000)
                .requiring(&["opportunities"]),
            execute: ExecuteBehavior::PassThrough,
            integrate: StepSpec::new(CONCEPTS_INTEGRATE)
                .with_system(JSON_ONLY)
                .with_params(0.5, 3000),
        },
        PhaseStrategy {
            phase: 3,
            name: "drafts".to_string(),
            think: StepSpec::new(DRAFTS_THINK)
                .with_system(JSON_ONLY)
                .with_params(0.3, 1500)
                .requiring(&["concepts"]),
            execute: ExecuteBehavior::PassThrough,
            integrate: StepSpec::new(DRAFTS_INTEGRATE)
                .with_system(JSON_ONLY)
                .with_params(0.8, 4000),
        },
    ]
}

pub(crate) fn adapters() -> Vec<AdapterRule> {
    vec![AdapterRule::new(1, "trendedTopics", "opportunities")]
}
