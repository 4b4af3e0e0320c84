//! The polite "excuse" catalog: what the pipeline falls back to whenever a
//! stage fails in a way that shouldn't surface internals to the user —
//! an LLM timeout, a parse failure, a skill crash. Never a stack trace.

use rand::seq::SliceRandom;

/// Fixed catalog of non-technical fallback replies.
const EXCUSES: &[&str] = &[
    "Oh, you silly. Give me a sec to get my act together.",
    "My brain short-circuited. One sec.",
    "Hmm, that one slipped right past me. Try again?",
    "I tripped over my own wires there. Sorry!",
    "Let's pretend that didn't happen and try again.",
    "I completely lost the thread. Say that again?",
    "Brain fog. Give me another shot at that.",
    "Whoops, dropped that one. Try me again?",
    "I got distracted by something shiny. What was that?",
    "That one went over my head. One more time?",
    "I think I need more coffee. Try again in a bit?",
    "Static on the line. Could you repeat that?",
    "My circuits are a little crossed right now.",
    "I blinked and missed it. Try again?",
    "Something fizzled on my end. One more try?",
    "I'm drawing a blank. Mind rephrasing?",
    "That one's above my pay grade right now.",
    "I think I need a reboot. Try again soon?",
    "Lost in thought over here. Say that again?",
    "I promise I was listening. Just glitched. Try again?",
    "My gears are grinding a bit. Give me another go.",
    "That one zipped right by me.",
];

/// Pick a random excuse from the fixed catalog.
pub fn random() -> &'static str {
    EXCUSES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(EXCUSES[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_at_least_twenty_entries() {
        assert!(EXCUSES.len() >= 20);
    }

    #[test]
    fn random_always_returns_a_catalog_entry() {
        for _ in 0..50 {
            assert!(EXCUSES.contains(&random()));
        }
    }
}
