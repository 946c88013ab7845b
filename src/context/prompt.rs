//! Prompt rendering for comment replies.

use super::extract::CommentContext;
use crate::types::Comment;

const CONTENT_TRIGGERS: &[&str] = &["?", "help", "explain", "why", "how"];

/// Why the bot is answering a comment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseScenario {
    /// A reply in a thread the bot already took part in.
    BotReply,
    /// The comment `@`-mentions the bot.
    DirectMention,
    /// The comment reads like a question or a request for help.
    ContentTrigger,
    #[default]
    Default,
}

impl ResponseScenario {
    /// Classifies a comment. Earlier rules win: a reply to the bot is a
    /// [`BotReply`](Self::BotReply) even if it also mentions the bot.
    pub fn classify(comment: &Comment, bot_username: &str, in_reply_to_bot: bool) -> Self {
        if in_reply_to_bot {
            return ResponseScenario::BotReply;
        }
        let body = comment.body.to_lowercase();
        let bot = bot_username.trim_start_matches('@').to_lowercase();
        if !bot.is_empty() && body.contains(&format!("@{bot}")) {
            return ResponseScenario::DirectMention;
        }
        if CONTENT_TRIGGERS.iter().any(|t| body.contains(t)) {
            return ResponseScenario::ContentTrigger;
        }
        ResponseScenario::Default
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseScenario::BotReply => "bot_reply",
            ResponseScenario::DirectMention => "direct_mention",
            ResponseScenario::ContentTrigger => "content_trigger",
            ResponseScenario::Default => "default",
        }
    }

    fn guidance(&self) -> &'static [&'static str] {
        match self {
            ResponseScenario::BotReply => &[
                "This is a follow-up to a previous bot response",
                "Address any clarifications or additional questions",
            ],
            ResponseScenario::DirectMention => &[
                "User directly mentioned the bot, expects a response",
                "Provide helpful, actionable guidance",
            ],
            ResponseScenario::ContentTrigger => &[
                "Comment contains help/question keywords",
                "Assess if response adds value to the discussion",
            ],
            ResponseScenario::Default => &["Provide contextual, technical guidance"],
        }
    }
}

const COMMON_GUIDANCE: &[&str] = &[
    "Maintain professional, collaborative tone",
    "Focus on code quality and best practices",
    "Be concise but thorough",
];

/// Renders the reply prompt. Output depends only on the inputs.
pub fn build_prompt(ctx: &CommentContext, scenario: ResponseScenario) -> String {
    let mut prompt =
        String::from("You are an AI code review assistant analyzing a development discussion.\n\n");

    if !ctx.before_commits.is_empty() {
        prompt.push_str("**Recent Commits:**\n");
        for line in &ctx.before_commits {
            prompt.push_str(&format!("- {line}\n"));
        }
        prompt.push('\n');
    }

    if !ctx.before_comments.is_empty() {
        prompt.push_str("**Thread Context:**\n");
        for line in &ctx.before_comments {
            prompt.push_str(line);
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    if !ctx.code_context.is_empty() {
        prompt.push_str("**Code Context:**\n");
        prompt.push_str(&ctx.code_context);
        prompt.push_str("\n\n");
    }

    if !ctx.after_commits.is_empty() {
        prompt.push_str("**Subsequent Changes:**\n");
        for line in &ctx.after_commits {
            prompt.push_str(&format!("- {line}\n"));
        }
        prompt.push('\n');
    }

    prompt.push_str("**Response Guidelines:**\n");
    for line in scenario.guidance().iter().chain(COMMON_GUIDANCE) {
        prompt.push_str(&format!("- {line}\n"));
    }
    prompt.push('\n');
    prompt
}
