//! AST for the rule expression subset.
//!
//! Every node carries an [`ExprId`] allocated by the builder that produced
//! it. Ids are scoped to a single parse: node identity is what the regex
//! cache and the type map key on, so two independently parsed expressions
//! must never share nodes. Anything that synthesizes or copies nodes goes
//! through the [`AstBuilder`] capability rather than constructing `Expr`
//! values ad hoc.

/// Identifier for an AST node, unique within one parsed expression.
pub type ExprId = u64;

/// Well-known operator function names.
///
/// Operators are represented as calls so the macro translator can treat
/// every interior node uniformly.
pub mod operators {
    pub const CONDITIONAL: &str = "_?_:_";
    pub const LOGICAL_AND: &str = "_&&_";
    pub const LOGICAL_OR: &str = "_||_";
    pub const LOGICAL_NOT: &str = "!_";
    pub const EQUALS: &str = "_==_";
    pub const NOT_EQUALS: &str = "_!=_";
    pub const LESS: &str = "_<_";
    pub const LESS_EQUALS: &str = "_<=_";
    pub const GREATER: &str = "_>_";
    pub const GREATER_EQUALS: &str = "_>=_";
    pub const ADD: &str = "_+_";
    pub const SUBTRACT: &str = "_-_";
    pub const MULTIPLY: &str = "_*_";
    pub const DIVIDE: &str = "_/_";
    pub const MODULO: &str = "_%_";
    pub const NEGATE: &str = "-_";
    pub const INDEX: &str = "_[_]_";
    pub const IN: &str = "@in";

    /// Returns true if the name is one of the operator function names.
    pub fn is_operator(name: &str) -> bool {
        matches!(
            name,
            CONDITIONAL
                | LOGICAL_AND
                | LOGICAL_OR
                | LOGICAL_NOT
                | EQUALS
                | NOT_EQUALS
                | LESS
                | LESS_EQUALS
                | GREATER
                | GREATER_EQUALS
                | ADD
                | SUBTRACT
                | MULTIPLY
                | DIVIDE
                | MODULO
                | NEGATE
                | INDEX
                | IN
        )
    }
}

/// A literal constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

/// An entry in a map literal.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub key: Expr,
    pub value: Expr,
}

/// A field initializer in a struct literal.
#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub name: String,
    pub value: Expr,
}

/// A fold over a list or map, produced by macro expansion.
///
/// Semantics:
/// ```text
/// accu = accu_init
/// for iter_var in iter_range {
///     if !loop_condition { break }
///     accu = loop_step
/// }
/// return result
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    pub iter_var: String,
    pub iter_range: Expr,
    pub accu_var: String,
    pub accu_init: Expr,
    pub loop_condition: Expr,
    pub loop_step: Expr,
    pub result: Expr,
}

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub id: ExprId,
    pub kind: ExprKind,
}

/// Expression node kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    Ident(String),
    /// Field selection. `test_only` marks the expansion of `has(e.f)`.
    Select {
        operand: Box<Expr>,
        field: String,
        test_only: bool,
    },
    /// Function call, member form when `target` is set, global otherwise.
    Call {
        target: Option<Box<Expr>>,
        function: String,
        args: Vec<Expr>,
    },
    List {
        elements: Vec<Expr>,
    },
    Map {
        entries: Vec<MapEntry>,
    },
    Struct {
        type_name: String,
        fields: Vec<StructField>,
    },
    Comprehension(Box<Comprehension>),
}

impl Expr {
    /// The called function name, if this node is a call.
    pub fn call_function(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Call { function, .. } => Some(function),
            _ => None,
        }
    }

    /// The largest node id reachable from this expression.
    pub fn max_id(&self) -> ExprId {
        let mut max = self.id;
        self.visit(&mut |e| {
            if e.id > max {
                max = e.id;
            }
        });
        max
    }

    /// Visit every node in the tree, parents before children.
    pub fn visit(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match &self.kind {
            ExprKind::Literal(_) | ExprKind::Ident(_) => {}
            ExprKind::Select { operand, .. } => operand.visit(f),
            ExprKind::Call { target, args, .. } => {
                if let Some(target) = target {
                    target.visit(f);
                }
                for arg in args {
                    arg.visit(f);
                }
            }
            ExprKind::List { elements } => {
                for elem in elements {
                    elem.visit(f);
                }
            }
            ExprKind::Map { entries } => {
                for entry in entries {
                    entry.key.visit(f);
                    entry.value.visit(f);
                }
            }
            ExprKind::Struct { fields, .. } => {
                for field in fields {
                    field.value.visit(f);
                }
            }
            ExprKind::Comprehension(c) => {
                c.iter_range.visit(f);
                c.accu_init.visit(f);
                c.loop_condition.visit(f);
                c.loop_step.visit(f);
                c.result.visit(f);
            }
        }
    }
}

/// Capability for constructing AST nodes with fresh ids.
///
/// The parser and the macro translator both build nodes through this trait,
/// so copied subtrees always land in the id space of the tree that hosts
/// them.
pub trait AstBuilder {
    /// Allocate the next unique node id.
    fn next_id(&mut self) -> ExprId;

    fn expr(&mut self, kind: ExprKind) -> Expr {
        Expr {
            id: self.next_id(),
            kind,
        }
    }

    fn literal(&mut self, literal: Literal) -> Expr {
        self.expr(ExprKind::Literal(literal))
    }

    fn ident(&mut self, name: impl Into<String>) -> Expr {
        self.expr(ExprKind::Ident(name.into()))
    }

    fn select(&mut self, operand: Expr, field: impl Into<String>, test_only: bool) -> Expr {
        self.expr(ExprKind::Select {
            operand: Box::new(operand),
            field: field.into(),
            test_only,
        })
    }

    fn global_call(&mut self, function: impl Into<String>, args: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Call {
            target: None,
            function: function.into(),
            args,
        })
    }

    fn member_call(&mut self, target: Expr, function: impl Into<String>, args: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Call {
            target: Some(Box::new(target)),
            function: function.into(),
            args,
        })
    }

    fn list(&mut self, elements: Vec<Expr>) -> Expr {
        self.expr(ExprKind::List { elements })
    }

    fn map_literal(&mut self, entries: Vec<MapEntry>) -> Expr {
        self.expr(ExprKind::Map { entries })
    }

    fn struct_literal(&mut self, type_name: impl Into<String>, fields: Vec<StructField>) -> Expr {
        self.expr(ExprKind::Struct {
            type_name: type_name.into(),
            fields,
        })
    }

    fn comprehension(&mut self, comprehension: Comprehension) -> Expr {
        self.expr(ExprKind::Comprehension(Box::new(comprehension)))
    }
}

/// The standard node factory: a monotonically increasing id counter.
#[derive(Debug, Clone)]
pub struct ExprFactory {
    next: ExprId,
}

impl ExprFactory {
    /// Create a factory starting at id 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Create a factory whose ids continue past every id in `expr`.
    ///
    /// Use this to graft new nodes into an already-parsed tree.
    pub fn continuing(expr: &Expr) -> Self {
        Self {
            next: expr.max_id() + 1,
        }
    }
}

impl Default for ExprFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl AstBuilder for ExprFactory {
    fn next_id(&mut self) -> ExprId {
        let id = self.next;
        self.next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_allocates_unique_ids() {
        let mut factory = ExprFactory::new();
        let a = factory.ident("a");
        let b = factory.ident("b");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn continuing_factory_starts_past_max_id() {
        let mut factory = ExprFactory::new();
        let a = factory.ident("a");
        let b = factory.ident("b");
        let call = factory.global_call(operators::ADD, vec![a, b]);

        let mut next = ExprFactory::continuing(&call);
        let fresh = next.ident("c");
        assert!(fresh.id > call.max_id());
    }

    #[test]
    fn visit_reaches_all_nodes() {
        let mut factory = ExprFactory::new();
        let one = factory.literal(Literal::Int(1));
        let two = factory.literal(Literal::Int(2));
        let sum = factory.global_call(operators::ADD, vec![one, two]);

        let mut count = 0;
        sum.visit(&mut |_| count += 1);
        assert_eq!(count, 3);
    }

    #[test]
    fn operator_names() {
        assert!(operators::is_operator(operators::LOGICAL_AND));
        assert!(!operators::is_operator("matches"));
    }
}
