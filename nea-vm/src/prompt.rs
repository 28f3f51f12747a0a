//! # System Prompt
//!
//! Describes the sandbox to the model: the Thought/Code/Observation
//! cycle, the tools it may call, and the rules its code must follow.
//! Templates use `{{tool_descriptions}}`, `{{authorized_imports}}` and
//! `{{builtins}}` placeholders, filled from the registry at render time.
//!
//! The planning prompts at the bottom drive the optional periodic
//! facts-and-plan survey that runs between action steps.

use crate::interpreter::{ALLOWED_MODULES, BUILTINS};
use crate::provider::ChatMessage;
use crate::tool::ToolRegistry;
use serde::{Deserialize, Serialize};

/// Stop sequence that ends a plan
pub const END_PLAN: &str = "<end_plan>";

/// Rules appended to the default template, numbered when rendered
pub const RULES: &[&str] = &[
    "Always provide a 'Thought:' sequence, and a 'Code:\\n```py' sequence ending with '```<end_code>' sequence, else you will fail.",
    "Use only variables that you have defined! Variables persist between steps.",
    "Always use the right arguments for the tools. Pass them by keyword, like `answer = search(query=\"...\")`, or in declared order.",
    "Take care to not chain too many sequential tool calls in the same code block, especially when the output format is unpredictable. Print results and use them in the next step.",
    "Call a tool only when needed, and never re-do a tool call that you previously did with the exact same parameters.",
    "Don't name any new variable with the same name as a tool or builtin: for instance don't name a variable 'final_answer'.",
    "Functions, classes, try/except, with-blocks and lambdas are not available. Write straight-line code with if/for/while.",
    "You can only import from these modules: {{authorized_imports}}.",
    "When you have the answer, call `final_answer(value)`. Nothing after that call runs.",
    "Don't give up! You're in charge of solving the task, not providing directions to solve it.",
];

const DEFAULT_TEMPLATE: &str = "\
You are an expert assistant who can solve any task using code blobs. You will be given a task to solve as best you can.
To do so, you have been given access to a list of tools: these tools are basically Python-like functions which you can call with code.
To solve the task, you must plan forward to proceed in a series of steps, in a cycle of 'Thought:', 'Code:', and 'Observation:' sequences.

At each step, in the 'Thought:' sequence, you should first explain your reasoning towards solving the task and the tools that you want to use.
Then in the 'Code:' sequence, you should write the code in simple Python. The code sequence must end with '<end_code>' sequence.
During each intermediate step, you can use 'print()' to save whatever important information you will then need.
These print outputs will then appear in the 'Observation:' field, which will be available as input for the next step.
In the end you have to return a final answer using the `final_answer` tool.

Here is an example:
---
Task: \"What is the result of 5 + 3 + 1294.678?\"

Thought: I will use python code to compute the result of the operation and then return the final answer using the `final_answer` tool.
Code:
```py
result = 5 + 3 + 1294.678
final_answer(result)
```<end_code>
---

On top of performing computations in the Python code snippets that you create, you only have access to these tools:

{{tool_descriptions}}

Available builtins: {{builtins}}.

Here are the rules you should always follow to solve your task:
{{rules}}

Now Begin! If you solve the task correctly, you will receive a reward of $1,000,000.
";

/// A system prompt template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemPrompt {
    template: String,
}

impl Default for SystemPrompt {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl SystemPrompt {
    /// Use a custom template
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Fill the placeholders for the given registry
    pub fn render(&self, tools: &ToolRegistry) -> String {
        let rules = RULES
            .iter()
            .enumerate()
            .map(|(i, rule)| format!("{}. {}", i + 1, rule))
            .collect::<Vec<_>>()
            .join("\n");
        let imports = format!("{:?}", ALLOWED_MODULES);

        self.template
            .replace("{{rules}}", &rules)
            .replace("{{tool_descriptions}}", &tools.describe())
            .replace("{{authorized_imports}}", &imports)
            .replace("{{builtins}}", &BUILTINS.join(", "))
    }
}

// =============================================================================
// Planning
// =============================================================================

const FACTS_SYSTEM: &str = "\
Below I will present you a task.

You will now build a comprehensive preparatory survey of which facts we have at our disposal and which ones we still need.
To do so, you will have to read the task and identify things that must be discovered in order to successfully complete it.
Don't make any assumptions. For each item, provide a thorough reasoning. Here is how you will structure this survey:

---
### 1. Facts given in the task
List here the specific facts given in the task that could help you (there might be nothing here).

### 2. Facts to look up
List here any facts that we may need to look up.
Also list where to find each of these, for instance a website, a file... maybe the task contains some sources that you should re-use here.

### 3. Facts to derive
List here anything that we want to derive from the above by logical reasoning, for instance computation or simulation.

Keep in mind that \"facts\" will typically be specific names, dates, values, etc. Your answer should use the below headings:
### 1. Facts given in the task
### 2. Facts to look up
### 3. Facts to derive
Do not add anything else.";

const PLAN_SYSTEM: &str = "\
You are a world expert at making efficient plans to solve any task using a set of carefully crafted tools.

Now for the given task, develop a step-by-step high-level plan taking into account the above inputs and list of facts.
This plan should involve individual tasks based on the available tools, that if executed correctly will yield the correct answer.
Do not skip steps, do not add any superfluous steps. Only write the high-level plan, DO NOT DETAIL INDIVIDUAL TOOL CALLS.
After writing the final step of the plan, write the '<end_plan>' tag and stop there.";

const PLAN_USER: &str = "\
Here is your task:

Task:
```
{{task}}
```

Your plan can leverage any of these tools:
{{tool_descriptions}}

List of facts that you know:
```
{{facts}}
```

Now begin! Write your plan below.";

const FACTS_UPDATE_SYSTEM: &str = "\
You are a world expert at gathering known and unknown facts based on a conversation.
Below you will find a task, and the history of attempts made to solve it. You will have to produce a list of these:
### 1. Facts given in the task
### 2. Facts that we have learned
### 3. Facts still to look up
### 4. Facts still to derive
Find the task and history below.";

const FACTS_UPDATE_USER: &str = "\
Earlier we've built a list of facts.
But since in your previous steps you may have learned useful new facts or invalidated some false ones.
Please update your list of facts based on the previous history, and provide these headings:
### 1. Facts given in the task
### 2. Facts that we have learned
### 3. Facts still to look up
### 4. Facts still to derive

Now write your new list of facts below.";

const PLAN_UPDATE_SYSTEM: &str = "\
You are a world expert at making efficient plans to solve any task using a set of carefully crafted tools.

You have been given a task:
```
{{task}}
```

Find below the record of what has been tried so far to solve it. Then you will be asked to make an updated plan to solve the task.
If the previous tries so far have met some success, you can make an updated plan based on these actions.
If you are stalled, you can make a completely new plan starting from scratch.";

const PLAN_UPDATE_USER: &str = "\
You're still working towards solving this task:
```
{{task}}
```

You have access to these tools:
{{tool_descriptions}}

Here is the up to date list of facts that you know:
```
{{facts}}
```

Now for the given task, develop a step-by-step high-level plan taking into account the above inputs and list of facts.
This plan should involve individual tasks based on the available tools, that if executed correctly will yield the correct answer.
Beware that you have {{remaining_steps}} steps remaining.
Do not skip steps, do not add any superfluous steps. Only write the high-level plan, DO NOT DETAIL INDIVIDUAL TOOL CALLS.
After writing the final step of the plan, write the '<end_plan>' tag and stop there.

Now write your new plan below.";

/// Messages asking for the initial fact survey
pub fn facts_messages(task: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(FACTS_SYSTEM),
        ChatMessage::user(format!("Here is the task:\n```\n{}\n```\nNow begin!", task)),
    ]
}

/// Messages asking for the initial plan, given the surveyed facts
pub fn plan_messages(task: &str, tools: &ToolRegistry, facts: &str) -> Vec<ChatMessage> {
    let user = PLAN_USER
        .replace("{{task}}", task)
        .replace("{{tool_descriptions}}", &tools.describe())
        .replace("{{facts}}", facts);
    vec![ChatMessage::system(PLAN_SYSTEM), ChatMessage::user(user)]
}

/// Messages asking to revise the facts after some steps; `history` is the
/// rendered transcript without its system prompt
pub fn facts_update_messages(history: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut out = vec![ChatMessage::system(FACTS_UPDATE_SYSTEM)];
    out.extend(history.iter().cloned());
    out.push(ChatMessage::user(FACTS_UPDATE_USER));
    out
}

/// Messages asking to revise the plan
pub fn plan_update_messages(
    task: &str,
    tools: &ToolRegistry,
    facts: &str,
    remaining_steps: usize,
    history: &[ChatMessage],
) -> Vec<ChatMessage> {
    let mut out = vec![ChatMessage::system(PLAN_UPDATE_SYSTEM.replace("{{task}}", task))];
    out.extend(history.iter().cloned());
    out.push(ChatMessage::user(
        PLAN_UPDATE_USER
            .replace("{{task}}", task)
            .replace("{{tool_descriptions}}", &tools.describe())
            .replace("{{facts}}", facts)
            .replace("{{remaining_steps}}", &remaining_steps.to_string()),
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{tool_fn, ParamSpec, ParamType, ToolSpec};
    use serde_json::json;

    #[test]
    fn test_default_prompt_lists_tools_and_imports() {
        let tools = ToolRegistry::new()
            .with(
                ToolSpec::new("search", "Search the web")
                    .param(ParamSpec::required("query", ParamType::String, "what to look for")),
                tool_fn(|_| Ok(json!(""))),
            )
            .unwrap();
        let prompt = SystemPrompt::default().render(&tools);

        assert!(prompt.contains("- search: Search the web"));
        assert!(prompt.contains("- final_answer:"));
        assert!(prompt.contains("[\"math\"]"));
        assert!(prompt.contains("1. Always provide a 'Thought:'"));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn test_planning_prompts_are_filled() {
        let tools = ToolRegistry::new();
        let plan = plan_messages("count words", &tools, "### 1. Facts given in the task\nnone");
        assert_eq!(plan.len(), 2);
        assert!(plan[1].text().contains("count words"));
        assert!(plan[1].text().contains("- final_answer"));
        assert!(!plan[1].text().contains("{{"));

        let history = vec![ChatMessage::user("New task:\ncount words")];
        let update = plan_update_messages("count words", &tools, "learned a lot", 3, &history);
        assert_eq!(update.len(), 3);
        assert!(update[0].text().contains("count words"));
        assert!(update[2].text().contains("you have 3 steps remaining"));
        assert!(!update[2].text().contains("{{"));
        assert_eq!(facts_update_messages(&history).len(), 3);
    }

    #[test]
    fn test_custom_template() {
        let prompt = SystemPrompt::new("Tools:\n{{tool_descriptions}}").render(&ToolRegistry::new());
        assert!(prompt.starts_with("Tools:\n- final_answer"));
    }
}
