//! Static allow-list check run over a parsed block before it executes.
//!
//! Every name a block references must be one of: a variable already in
//! the sandbox state, a name bound somewhere in the block itself, a
//! registered tool, an allowed builtin, `final_answer`, or something
//! imported from an allowed module. Anything else rejects the whole block
//! so no statement runs.

use crate::ast::{Expr, FStringPart, Stmt, StmtKind, Target};
use crate::error::{self, Error, ErrorKind, Result};
use crate::interpreter::{ALLOWED_MODULES, BUILTINS, FINAL_ANSWER};
use crate::sandbox::SandboxState;
use crate::tool::ToolRegistry;
use std::collections::HashSet;

struct Checker<'a> {
    state: &'a SandboxState,
    tools: &'a ToolRegistry,
    bound: HashSet<String>,
}

/// Validate a block against the names it is allowed to touch
pub(crate) fn check_program(body: &[Stmt], state: &SandboxState, tools: &ToolRegistry) -> Result<()> {
    let mut bound = HashSet::new();
    collect_block(body, &mut bound);
    let checker = Checker {
        state,
        tools,
        bound,
    };
    checker.block(body, 0)
}

fn collect_block(body: &[Stmt], out: &mut HashSet<String>) {
    for stmt in body {
        let mut names = Vec::new();
        match &stmt.kind {
            StmtKind::Assign { targets, .. } => targets.iter().for_each(|t| t.bound_names(&mut names)),
            StmtKind::AugAssign { target, .. } => target.bound_names(&mut names),
            StmtKind::For { target, body, .. } => {
                target.bound_names(&mut names);
                collect_block(body, out);
            }
            StmtKind::If { body, orelse, .. } => {
                collect_block(body, out);
                collect_block(orelse, out);
            }
            StmtKind::While { body, .. } => collect_block(body, out),
            StmtKind::Import { module, alias } => {
                names.push(alias.clone().unwrap_or_else(|| module.clone()))
            }
            StmtKind::ImportFrom { names: imported, .. } => {
                for (name, alias) in imported {
                    names.push(alias.clone().unwrap_or_else(|| name.clone()));
                }
            }
            StmtKind::Expr(_) | StmtKind::Break | StmtKind::Continue | StmtKind::Pass => {}
        }
        out.extend(names);
    }
}

impl Checker<'_> {
    fn known(&self, name: &str) -> bool {
        self.bound.contains(name)
            || self.state.vars.contains_key(name)
            || self.state.modules.contains_key(name)
            || self.state.imported.contains_key(name)
            || self.tools.contains(name)
            || name == FINAL_ANSWER
            || BUILTINS.contains(&name)
    }

    fn block(&self, body: &[Stmt], loop_depth: usize) -> Result<()> {
        for stmt in body {
            self.stmt(stmt, loop_depth)
                .map_err(|e| match e.context_value("line") {
                    Some(_) => e,
                    None => e.with_context("line", stmt.line.to_string()),
                })?;
        }
        Ok(())
    }

    fn stmt(&self, stmt: &Stmt, loop_depth: usize) -> Result<()> {
        match &stmt.kind {
            StmtKind::Expr(e) => self.expr(e),
            StmtKind::Assign { targets, value } => {
                for t in targets {
                    self.target(t)?;
                }
                self.expr(value)
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.target(target)?;
                self.expr(value)
            }
            StmtKind::If { test, body, orelse } => {
                self.expr(test)?;
                self.block(body, loop_depth)?;
                self.block(orelse, loop_depth)
            }
            StmtKind::For { target, iter, body } => {
                self.target(target)?;
                self.expr(iter)?;
                self.block(body, loop_depth + 1)
            }
            StmtKind::While { test, body } => {
                self.expr(test)?;
                self.block(body, loop_depth + 1)
            }
            StmtKind::Break | StmtKind::Continue if loop_depth == 0 => {
                let word = if matches!(stmt.kind, StmtKind::Break) {
                    "break"
                } else {
                    "continue"
                };
                Err(error::syntax(format!("'{}' outside loop", word), stmt.line))
            }
            StmtKind::Break | StmtKind::Continue | StmtKind::Pass => Ok(()),
            StmtKind::Import { module, alias } => {
                self.import(module)?;
                self.rebind(alias.as_deref().unwrap_or(module))
            }
            StmtKind::ImportFrom { module, names } => {
                self.import(module)?;
                for (name, alias) in names {
                    self.rebind(alias.as_deref().unwrap_or(name))?;
                }
                Ok(())
            }
        }
    }

    fn import(&self, module: &str) -> Result<()> {
        if ALLOWED_MODULES.contains(&module) {
            Ok(())
        } else {
            Err(error::forbidden_import(module, ALLOWED_MODULES))
        }
    }

    fn rebind(&self, name: &str) -> Result<()> {
        if self.tools.contains(name) {
            Err(error::reserved_assignment(name, "tool"))
        } else if name == FINAL_ANSWER || BUILTINS.contains(&name) {
            Err(error::reserved_assignment(name, "builtin function"))
        } else {
            Ok(())
        }
    }

    fn target(&self, target: &Target) -> Result<()> {
        match target {
            Target::Name(name) => self.rebind(name),
            Target::Subscript { value, index } => {
                self.expr(value)?;
                self.expr(index)
            }
            Target::Tuple(items) => items.iter().try_for_each(|t| self.target(t)),
        }
    }

    fn exprs<'e>(&self, exprs: impl IntoIterator<Item = &'e Expr>) -> Result<()> {
        exprs.into_iter().try_for_each(|e| self.expr(e))
    }

    fn expr(&self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Literal(_) => Ok(()),
            Expr::Name(name) => {
                if self.known(name) {
                    Ok(())
                } else {
                    Err(error::forbidden(format!(
                        "forbidden access to name '{}': it is not a tool, an allowed builtin, \
                         an imported name or a variable defined in the code",
                        name
                    ))
                    .with_context("name", name.as_str()))
                }
            }
            Expr::FString(parts) => parts.iter().try_for_each(|p| match p {
                FStringPart::Literal(_) => Ok(()),
                FStringPart::Field { expr, .. } => self.expr(expr),
            }),
            Expr::List(items) | Expr::Tuple(items) => self.exprs(items),
            Expr::Dict(pairs) => pairs.iter().try_for_each(|(k, v)| {
                self.expr(k)?;
                self.expr(v)
            }),
            Expr::Attribute { value, attr } => {
                if attr.starts_with("__") {
                    return Err(error::forbidden(format!(
                        "forbidden access to dunder attribute '{}'",
                        attr
                    )));
                }
                self.expr(value)
            }
            Expr::Subscript { value, index } => {
                self.expr(value)?;
                self.expr(index)
            }
            Expr::Slice {
                value,
                lower,
                upper,
                step,
            } => {
                self.expr(value)?;
                self.exprs([lower, upper, step].into_iter().flatten().map(|b| b.as_ref()))
            }
            Expr::Call { func, args, kwargs } => {
                if let Expr::Name(name) = func.as_ref() {
                    if !self.known(name) {
                        return Err(Error::new(
                            ErrorKind::Forbidden,
                            format!(
                                "forbidden function evaluation: '{}' is not among the \
                                 explicitly allowed tools or defined/imported in the code",
                                name
                            ),
                        )
                        .with_operation("sandbox::execute")
                        .with_context("name", name.as_str()));
                    }
                } else {
                    self.expr(func)?;
                }
                self.exprs(args)?;
                self.exprs(kwargs.iter().map(|(_, e)| e))
            }
            Expr::Unary { operand, .. } => self.expr(operand),
            Expr::Binary { left, right, .. } | Expr::Bool { left, right, .. } => {
                self.expr(left)?;
                self.expr(right)
            }
            Expr::Compare { left, ops } => {
                self.expr(left)?;
                self.exprs(ops.iter().map(|(_, e)| e))
            }
            Expr::IfExp { test, body, orelse } => {
                self.exprs([test.as_ref(), body.as_ref(), orelse.as_ref()])
            }
            Expr::ListComp {
                element,
                target,
                iter,
                conds,
            } => {
                self.expr(iter)?;
                self.comprehension(target, conds, [element.as_ref()])
            }
            Expr::DictComp {
                key,
                value,
                target,
                iter,
                conds,
            } => {
                self.expr(iter)?;
                self.comprehension(target, conds, [key.as_ref(), value.as_ref()])
            }
        }
    }

    fn comprehension<'e>(
        &self,
        target: &Target,
        conds: &'e [Expr],
        outputs: impl IntoIterator<Item = &'e Expr>,
    ) -> Result<()> {
        self.target(target)?;
        let mut names = Vec::new();
        target.bound_names(&mut names);
        let mut bound = self.bound.clone();
        bound.extend(names);
        let inner = Checker {
            state: self.state,
            tools: self.tools,
            bound,
        };
        inner.exprs(conds)?;
        inner.exprs(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::tool::{tool_fn, ParamSpec, ParamType, ToolSpec};
    use serde_json::json;

    fn tools() -> ToolRegistry {
        ToolRegistry::new()
            .with(
                ToolSpec::new("search", "Search the web")
                    .param(ParamSpec::required("query", ParamType::String, "query")),
                tool_fn(|_| Ok(json!("result"))),
            )
            .unwrap()
    }

    fn check(code: &str, state: &SandboxState) -> Result<()> {
        check_program(&parse(code).unwrap(), state, &tools())
    }

    #[test]
    fn test_allows_known_names() {
        let state = SandboxState::new().with_variables(
            [("prior".to_string(), json!(1))].into_iter().collect(),
        );
        let code = "
import math
x = search('rust') + str(prior)
y = [v * 2 for v in range(3) if v]
for i, c in enumerate(x):
    if i > 2:
        break
later = z if True else 0
z = math.sqrt(4)
final_answer(x)
";
        assert!(check(code, &state).is_ok());
    }

    #[test]
    fn test_rejects_unknown_names_before_running() {
        let state = SandboxState::new();
        for code in ["open('/etc/passwd')", "x = os.system", "print(undefined_thing)"] {
            let err = check(code, &state).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Forbidden, "{code}");
        }
    }

    #[test]
    fn test_rejects_imports_and_reserved_targets() {
        let state = SandboxState::new();
        let err = check("import subprocess", &state).unwrap_err();
        assert!(err.message().contains("subprocess"));

        let err = check("x = 1\nsearch = 'shadow'", &state).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(err.context_value("line"), Some("2"));
    }

    #[test]
    fn test_rejects_dunder_and_stray_break() {
        let state = SandboxState::new();
        assert_eq!(
            check("x = 'a'.__class__", &state).unwrap_err().kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(check("break", &state).unwrap_err().kind(), ErrorKind::Syntax);
    }

    #[test]
    fn test_comprehension_names_are_scoped() {
        let state = SandboxState::new();
        assert!(check("y = [v for v in range(3)]\nprint(v)", &state).is_err());
    }
}
