use std::fmt;

use super::BlockStatement;

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Identifier(String),
    IntegerLiteral(i64),
    Boolean(bool),
    StringLiteral(String),
    ListLiteral(Vec<Expression>),
    HashLiteral(Vec<(Expression, Expression)>),
    Index(IndexExpression),
    Prefix(PrefixExpression),
    Infix(InfixExpression),
    If(IfExpression),
    Function(FunctionExpression),
    Call(CallExpression),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexExpression {
    pub left: Box<Expression>,
    pub index: Box<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrefixExpression {
    pub operator: String,
    pub right: Box<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfixExpression {
    pub left: Box<Expression>,
    pub operator: String,
    pub right: Box<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfExpression {
    pub condition: Box<Expression>,
    pub consequence: BlockStatement,
    pub alternative: Option<BlockStatement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionExpression {
    pub parameters: Vec<String>,
    pub body: BlockStatement,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallExpression {
    pub function: Box<Expression>,
    pub arguments: Vec<Expression>,
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Identifier(name) => write!(f, "{name}"),
            Expression::IntegerLiteral(value) => write!(f, "{value}"),
            Expression::Boolean(value) => write!(f, "{value}"),
            Expression::StringLiteral(value) => write!(f, "{value}"),
            Expression::ListLiteral(elements) => {
                let items: Vec<String> = elements.iter().map(|e| e.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Expression::HashLiteral(pairs) => {
                let items: Vec<String> =
                    pairs.iter().map(|(k, v)| format!("{k}:{v}")).collect();
                write!(f, "{{{}}}", items.join(", "))
            }
            Expression::Index(expr) => write!(f, "({}[{}])", expr.left, expr.index),
            Expression::Prefix(expr) => write!(f, "({}{})", expr.operator, expr.right),
            Expression::Infix(expr) => {
                write!(f, "({} {} {})", expr.left, expr.operator, expr.right)
            }
            Expression::If(expr) => {
                write!(f, "if{} {}", expr.condition, expr.consequence)?;
                if let Some(alt) = &expr.alternative {
                    write!(f, "else {alt}")?;
                }
                Ok(())
            }
            Expression::Function(expr) => {
                let name = match &expr.name {
                    Some(name) => format!("<{name}>"),
                    None => String::new(),
                };
                write!(f, "fn{name}({}) {}", expr.parameters.join(", "), expr.body)
            }
            Expression::Call(expr) => {
                let args: Vec<String> = expr.arguments.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", expr.function, args.join(", "))
            }
        }
    }
}
