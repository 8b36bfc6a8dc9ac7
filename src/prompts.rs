//! Prompt templates for every LLM call the crate makes.

/// System instruction for summarization runs.
pub const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a clinical summarization assistant. Write plain clinical prose and never invent findings.";

/// System instruction for question answering.
pub const RAG_SYSTEM_PROMPT: &str =
    "You are a clinical assistant. Answer only from the supplied patient context and say so when it is insufficient.";

/// Map stage: one chunk of a serialized bundle.
pub fn chunk_prompt(chunk: &str, index: usize, total: usize) -> String {
    format!(
        "Below is part {part} of {total} of a patient's FHIR record.\n\
         Summarize the clinically relevant content: diagnoses, medications, lab results and notable observations.\n\
         Give only the summary, without describing how you produced it.\n\n\
         FHIR data:\n{chunk}\n\nSummary:",
        part = index + 1,
    )
}

/// Reduce stage: several partial summaries merged into one.
pub fn merge_prompt(joined: &str, batch: usize) -> String {
    format!(
        "The following are partial summaries of one patient's record (group {group}).\n\
         Merge them into a single coherent intermediate summary without repeating facts.\n\n\
         {joined}\n\nIntermediate summary:",
        group = batch + 1,
    )
}

/// Final stage over the capped intermediate summaries.
pub fn final_prompt(joined: &str) -> String {
    format!(
        "Using the intermediate summaries below, write a concise final summary of the patient's condition.\n\
         Give only the summary, without describing how you produced it.\n\n\
         {joined}\n\nFinal patient summary:"
    )
}

/// Per-resource-type section summary with explicit length limits.
pub fn section_prompt(resource_type: &str, text: &str, max_words: usize, max_sentences: usize) -> String {
    format!(
        "Summarize the following {resource_type} information for one patient.\n\
         - At most {max_sentences} sentences or {max_words} words.\n\
         - Use natural language.\n\
         - Leave out codes and identifiers.\n\n\
         --- BEGIN DATA ---\n{text}\n--- END DATA ---\n\n\
         Summary of {resource_type}:"
    )
}

/// Overview built from the per-type section summaries.
pub fn sections_final_prompt(joined: &str) -> String {
    format!(
        "Using the section summaries below, write a readable overview of the patient's overall clinical picture in one or two paragraphs.\n\n\
         {joined}\n\nOverview:"
    )
}

/// Retrieval-augmented answer prompt.
pub fn rag_prompt(context: &str, question: &str) -> String {
    format!(
        "Answer the question precisely and briefly using only the extracted patient data.\n\n\
         --- BEGIN CONTEXT ---\n{context}\n--- END CONTEXT ---\n\n\
         Question: {question}\nAnswer:"
    )
}
