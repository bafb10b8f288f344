use oxigraph::model::{NamedNode, Term, Variable};
use oxigraph::sparql::QuerySolution;
use spargebra::algebra::{Expression, Function, GraphPattern};

const XSD_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema#";

/// A partial solution: an ordered assignment of terms to variables.
///
/// Bindings are never updated in place during extension evaluation,
/// [`merge`](Self::merge) and [`forget`](Self::forget) return new values.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Binding {
    values: Vec<(Variable, Term)>,
}

/// The sequence of bindings produced by the evaluation of a subtree.
pub type BindingSet = Vec<Binding>;

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, variable: &Variable) -> Option<&Term> {
        self.values
            .iter()
            .find_map(|(v, t)| (v == variable).then_some(t))
    }

    pub fn contains(&self, variable: &Variable) -> bool {
        self.get(variable).is_some()
    }

    /// Returns a copy of this binding with `variable` bound to `term`.
    ///
    /// An existing value for `variable` is replaced in place, keeping the variable order.
    ///
    /// ```
    /// use oxigraph::model::{Literal, Variable};
    /// use sparext::Binding;
    ///
    /// let x = Variable::new("x")?;
    /// let first = Binding::new().merge(x.clone(), Literal::from("a"));
    /// let second = first.merge(x.clone(), Literal::from("b"));
    /// assert_eq!(first.get(&x), Some(&Literal::from("a").into()));
    /// assert_eq!(second.get(&x), Some(&Literal::from("b").into()));
    /// assert_eq!(second.len(), 1);
    /// # Result::<_, Box<dyn std::error::Error>>::Ok(())
    /// ```
    #[must_use]
    pub fn merge(&self, variable: Variable, term: impl Into<Term>) -> Self {
        let term = term.into();
        let mut values = self.values.clone();
        if let Some(entry) = values.iter_mut().find(|(v, _)| *v == variable) {
            entry.1 = term;
        } else {
            values.push((variable, term));
        }
        Self { values }
    }

    /// Returns a copy of this binding without `variable`.
    #[must_use]
    pub fn forget(&self, variable: &Variable) -> Self {
        Self {
            values: self
                .values
                .iter()
                .filter(|(v, _)| v != variable)
                .cloned()
                .collect(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (Variable, Term)> {
        self.values.iter()
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.values.iter().map(|(v, _)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<QuerySolution> for Binding {
    fn from(solution: QuerySolution) -> Self {
        solution
            .iter()
            .map(|(v, t)| (v.clone(), t.clone()))
            .collect()
    }
}

impl FromIterator<(Variable, Term)> for Binding {
    fn from_iter<I: IntoIterator<Item = (Variable, Term)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |binding, (v, t)| binding.merge(v, t))
    }
}

impl IntoIterator for Binding {
    type Item = (Variable, Term);
    type IntoIter = std::vec::IntoIter<(Variable, Term)>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<'a> IntoIterator for &'a Binding {
    type Item = &'a (Variable, Term);
    type IntoIter = std::slice::Iter<'a, (Variable, Term)>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The expression of a `BIND` clause.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BindExpression {
    /// A call to a function identified by an IRI, possibly a registered extension function.
    FunctionCall {
        function: NamedNode,
        arguments: Vec<Expression>,
    },
    /// Any other expression, left to the built-in evaluator.
    ///
    /// XSD constructor functions like `xsd:integer(?x)` are built-ins.
    Builtin(Expression),
}

impl BindExpression {
    /// The IRI of the called function if this is an extension function call.
    pub fn function(&self) -> Option<&NamedNode> {
        match self {
            Self::FunctionCall { function, .. } => Some(function),
            Self::Builtin(_) => None,
        }
    }
}

impl From<Expression> for BindExpression {
    fn from(expression: Expression) -> Self {
        match expression {
            Expression::FunctionCall(Function::Custom(function), arguments)
                if !function.as_str().starts_with(XSD_NAMESPACE) =>
            {
                Self::FunctionCall {
                    function,
                    arguments,
                }
            }
            expression => Self::Builtin(expression),
        }
    }
}

impl From<BindExpression> for Expression {
    fn from(expression: BindExpression) -> Self {
        match expression {
            BindExpression::FunctionCall {
                function,
                arguments,
            } => Self::FunctionCall(Function::Custom(function), arguments),
            BindExpression::Builtin(expression) => expression,
        }
    }
}

/// A `BIND` operator: `inner` extended with `variable` set to the value of `expression`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExtendNode {
    pub inner: GraphPattern,
    pub variable: Variable,
    pub expression: BindExpression,
}

impl ExtendNode {
    pub fn new(
        inner: GraphPattern,
        variable: Variable,
        expression: impl Into<BindExpression>,
    ) -> Self {
        Self {
            inner,
            variable,
            expression: expression.into(),
        }
    }
}

impl From<ExtendNode> for GraphPattern {
    fn from(node: ExtendNode) -> Self {
        Self::Extend {
            inner: Box::new(node.inner),
            variable: node.variable,
            expression: node.expression.into(),
        }
    }
}

/// A node of the query algebra as seen by the extension evaluator.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AlgebraNode {
    Extend(ExtendNode),
    Other(GraphPattern),
}

impl AlgebraNode {
    /// The name of the algebra operator, e.g. `Extend` or `LeftJoin`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Extend(_) => "Extend",
            Self::Other(pattern) => match pattern {
                GraphPattern::Bgp { .. } => "BGP",
                GraphPattern::Path { .. } => "Path",
                GraphPattern::Join { .. } => "Join",
                GraphPattern::LeftJoin { .. } => "LeftJoin",
                GraphPattern::Filter { .. } => "Filter",
                GraphPattern::Union { .. } => "Union",
                GraphPattern::Graph { .. } => "Graph",
                GraphPattern::Extend { .. } => "Extend",
                GraphPattern::Minus { .. } => "Minus",
                GraphPattern::Values { .. } => "Values",
                GraphPattern::OrderBy { .. } => "OrderBy",
                GraphPattern::Project { .. } => "Project",
                GraphPattern::Distinct { .. } => "Distinct",
                GraphPattern::Reduced { .. } => "Reduced",
                GraphPattern::Slice { .. } => "Slice",
                GraphPattern::Group { .. } => "Group",
                GraphPattern::Service { .. } => "Service",
                _ => "Unknown",
            },
        }
    }
}

impl From<GraphPattern> for AlgebraNode {
    fn from(pattern: GraphPattern) -> Self {
        match pattern {
            GraphPattern::Extend {
                inner,
                variable,
                expression,
            } => Self::Extend(ExtendNode::new(*inner, variable, expression)),
            pattern => Self::Other(pattern),
        }
    }
}

impl From<ExtendNode> for AlgebraNode {
    fn from(node: ExtendNode) -> Self {
        Self::Extend(node)
    }
}

impl From<AlgebraNode> for GraphPattern {
    fn from(node: AlgebraNode) -> Self {
        match node {
            AlgebraNode::Extend(node) => node.into(),
            AlgebraNode::Other(pattern) => pattern,
        }
    }
}
