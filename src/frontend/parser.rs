use crate::frontend::ast::{
    BinaryOp, Block, Callee, Class, Expr, ExprKind, Method, Program, Statement, Type, UnaryOp,
    VarDecl,
};
use chumsky::error::Rich;
use chumsky::prelude::*;
use thiserror::Error;

type Extra<'src> = extra::Err<Rich<'src, char>>;

const KEYWORDS: &[&str] = &[
    "class", "if", "else", "while", "readln", "println", "return", "this", "null", "new", "true",
    "false",
];

#[derive(Debug, Error)]
#[error("{}", .errors.join("\n"))]
pub struct ParseError {
    pub errors: Vec<String>,
}

pub fn parse(source_code: &str) -> Result<Program, ParseError> {
    ws().ignore_then(program())
        .then_ignore(end())
        .parse(source_code)
        .into_result()
        .map_err(|errors| ParseError {
            errors: errors
                .iter()
                .map(|e| {
                    let (line, column) = line_col(source_code, e.span().start);
                    format!("{}:{}: {}", line, column, e)
                })
                .collect(),
        })
}

fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset.min(source.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.chars().rev().take_while(|c| *c != '\n').count() + 1;
    (line, column)
}

/* Whitespace, `// line` and `/* block */` comments */
fn ws<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    let line = just("//").then(any().and_is(just('\n').not()).repeated()).ignored();
    let block = just("/*")
        .then(any().and_is(just("*/").not()).repeated())
        .then(just("*/"))
        .ignored();
    text::whitespace().then(line.or(block).then(text::whitespace()).repeated()).ignored()
}

fn sym<'src>(s: &'static str) -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    just(s).padded_by(ws()).ignored()
}

fn keyword<'src>(k: &'static str) -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    text::keyword(k).padded_by(ws()).ignored()
}

fn ident<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    text::ident()
        .try_map(|name: &str, span| {
            if KEYWORDS.contains(&name) {
                Err(Rich::custom(span, format!("keyword '{}' cannot be used as a name", name)))
            } else {
                Ok(name.to_string())
            }
        })
        .padded_by(ws())
}

fn type_name<'src>() -> impl Parser<'src, &'src str, Type, Extra<'src>> + Clone {
    ident().map(|name| Type::from_name(&name))
}

fn var_decl<'src>() -> impl Parser<'src, &'src str, VarDecl, Extra<'src>> + Clone {
    type_name().then(ident()).map(|(ty, name)| VarDecl { ty, name })
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::new(ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) })
}

fn expression<'src>() -> impl Parser<'src, &'src str, Expr, Extra<'src>> + Clone {
    recursive(|expr| {
        let args = expr
            .clone()
            .separated_by(sym(","))
            .collect::<Vec<_>>()
            .delimited_by(sym("("), sym(")"));

        let int_lit = text::int(10)
            .try_map(|digits: &str, span| {
                digits
                    .parse::<i32>()
                    .map_err(|e| Rich::custom(span, format!("integer literal {}: {}", digits, e)))
            })
            .padded_by(ws())
            .map(|value| ExprKind::IntLit { value });

        let escape = just('\\').then(any()).ignored();
        let str_lit = none_of("\\\"")
            .ignored()
            .or(escape)
            .repeated()
            .to_slice()
            .delimited_by(just('"'), just('"'))
            .padded_by(ws())
            .map(|raw: &str| ExprKind::StrLit { value: raw.to_string() });

        let new_object = keyword("new")
            .ignore_then(ident())
            .then_ignore(sym("("))
            .then_ignore(sym(")"))
            .map(|class| ExprKind::New { class });

        /*
         * An atom is a literal, `this`, `null`, `new C()`, a parenthesised
         * expression, a local call `m(..)` or a bare identifier
         */
        let atom = choice((
            int_lit,
            str_lit,
            keyword("true").to(ExprKind::BoolLit { value: true }),
            keyword("false").to(ExprKind::BoolLit { value: false }),
            keyword("null").to(ExprKind::Null),
            keyword("this").to(ExprKind::This),
            new_object,
            ident().then(args.clone()).map(|(name, args)| ExprKind::Call {
                callee: Callee::Local { name },
                args,
                signature: None,
            }),
            ident().map(|name| ExprKind::Variable { name }),
        ))
        .map(Expr::new)
        .or(expr.clone().delimited_by(sym("("), sym(")")));

        // `a.f` and `a.m(..)`, left to right
        let postfix = atom
            .foldl(
                sym(".").ignore_then(ident()).then(args.or_not()).repeated(),
                |object, (name, args)| {
                    let object = Box::new(object);
                    Expr::new(match args {
                        Some(args) => ExprKind::Call {
                            callee: Callee::Member { object, name },
                            args,
                            signature: None,
                        },
                        None => ExprKind::Field { object, field: name },
                    })
                },
            )
            .boxed();

        let unary = choice((sym("-").to(UnaryOp::Neg), sym("!").to(UnaryOp::Not)))
            .repeated()
            .foldr(postfix, |op, operand| {
                Expr::new(ExprKind::Unary { op, operand: Box::new(operand) })
            })
            .boxed();

        let product = unary
            .clone()
            .foldl(
                choice((sym("*").to(BinaryOp::Mul), sym("/").to(BinaryOp::Div)))
                    .then(unary)
                    .repeated(),
                |left, (op, right)| binary(op, left, right),
            )
            .boxed();

        let sum = product
            .clone()
            .foldl(
                choice((sym("+").to(BinaryOp::Add), sym("-").to(BinaryOp::Sub)))
                    .then(product)
                    .repeated(),
                |left, (op, right)| binary(op, left, right),
            )
            .boxed();

        // Relational operators do not chain
        let relation = sum
            .clone()
            .then(
                choice((
                    sym("<=").to(BinaryOp::Le),
                    sym(">=").to(BinaryOp::Ge),
                    sym("==").to(BinaryOp::Eq),
                    sym("!=").to(BinaryOp::Ne),
                    sym("<").to(BinaryOp::Lt),
                    sym(">").to(BinaryOp::Gt),
                ))
                .then(sum)
                .or_not(),
            )
            .map(|(left, rest)| match rest {
                Some((op, right)) => binary(op, left, right),
                None => left,
            })
            .boxed();

        let conjunction = relation
            .clone()
            .foldl(
                sym("&&").to(BinaryOp::And).then(relation).repeated(),
                |left, (op, right)| binary(op, left, right),
            )
            .boxed();

        conjunction
            .clone()
            .foldl(
                sym("||").to(BinaryOp::Or).then(conjunction).repeated(),
                |left, (op, right)| binary(op, left, right),
            )
            .boxed()
    })
}

fn statement<'src>() -> impl Parser<'src, &'src str, Statement, Extra<'src>> + Clone {
    let expr = expression();

    recursive(|statement| {
        let block = statement
            .repeated()
            .collect::<Vec<_>>()
            .delimited_by(sym("{"), sym("}"));

        let condition = expr.clone().delimited_by(sym("("), sym(")"));

        let if_stmt = keyword("if")
            .ignore_then(condition.clone())
            .then(block.clone())
            .then(keyword("else").ignore_then(block.clone()).or_not())
            .map(|((cond, then_block), else_block)| Statement::If {
                cond,
                then_block,
                else_block: else_block.unwrap_or_default(),
            });

        let while_stmt = keyword("while")
            .ignore_then(condition)
            .then(block)
            .map(|(cond, body)| Statement::While { cond, body });

        let readln = keyword("readln")
            .ignore_then(ident().delimited_by(sym("("), sym(")")))
            .then_ignore(sym(";"))
            .map(|name| Statement::Readln { name });

        let println = keyword("println")
            .ignore_then(expr.clone().delimited_by(sym("("), sym(")")))
            .then_ignore(sym(";"))
            .map(|expr| Statement::Println { expr });

        let return_stmt = keyword("return")
            .ignore_then(expr.clone().or_not())
            .then_ignore(sym(";"))
            .map(|expr| Statement::Return { expr });

        let assign = expr
            .clone()
            .then_ignore(sym("="))
            .then(expr.clone())
            .then_ignore(sym(";"))
            .try_map(|(target, value), span| {
                if matches!(target.kind, ExprKind::Variable { .. } | ExprKind::Field { .. }) {
                    Ok(Statement::Assign { target, value })
                } else {
                    Err(Rich::custom(span, "only variables and fields can be assigned"))
                }
            });

        let call = expr.clone().then_ignore(sym(";")).try_map(|call, span| {
            if matches!(call.kind, ExprKind::Call { .. }) {
                Ok(Statement::Call { call })
            } else {
                Err(Rich::custom(span, "expression statements must be method calls"))
            }
        });

        choice((if_stmt, while_stmt, readln, println, return_stmt, assign, call)).boxed()
    })
}

fn method<'src>() -> impl Parser<'src, &'src str, Method, Extra<'src>> + Clone {
    let formals = var_decl()
        .separated_by(sym(","))
        .collect::<Vec<_>>()
        .delimited_by(sym("("), sym(")"));

    let body = var_decl()
        .then_ignore(sym(";"))
        .repeated()
        .collect::<Vec<_>>()
        .then(statement().repeated().collect::<Vec<_>>())
        .delimited_by(sym("{"), sym("}"))
        .map(|(vars, statements)| Block { vars, statements });

    type_name()
        .then(ident())
        .then(formals)
        .then(body)
        .map(|(((return_type, name), formals), body)| Method { return_type, name, formals, body })
}

fn class<'src>() -> impl Parser<'src, &'src str, Class, Extra<'src>> + Clone {
    keyword("class")
        .ignore_then(ident())
        .then(
            var_decl()
                .then_ignore(sym(";"))
                .repeated()
                .collect::<Vec<_>>()
                .then(method().repeated().collect::<Vec<_>>())
                .delimited_by(sym("{"), sym("}")),
        )
        .map(|(name, (fields, methods))| Class { name, fields, methods })
}

/* Program Parser: the main class first, then every other class */
fn program<'src>() -> impl Parser<'src, &'src str, Program, Extra<'src>> {
    class()
        .then(class().repeated().collect::<Vec<_>>())
        .map(|(main_class, classes)| Program { main_class, classes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn expr_of(source: &str) -> Expr {
        let program = parse(&format!("class Main {{ Void main() {{ x = {}; }} }}", source)).expect("parse");
        match &program.main_class.methods[0].body.statements[0] {
            Statement::Assign { value, .. } => value.clone(),
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    fn int(value: i32) -> Expr {
        Expr::new(ExprKind::IntLit { value })
    }

    #[test]
    fn test_program_shape() {
        let program = parse(
            "class Main { Void main(Int argc) { Int x; x = 1; println(x); } }
             class Point { Int x; Point next; Int getX() { return x; } Void set(Int v, Bool b) { x = v; return; } }",
        )
        .expect("parse");

        assert_eq!(program.main_class.name, "Main");
        assert_eq!(program.main_class.methods[0].formals, vec![VarDecl { ty: Type::Int, name: "argc".into() }]);
        assert_eq!(program.classes.len(), 1);

        let point = &program.classes[0];
        assert_eq!(point.fields[1], VarDecl { ty: Type::Class("Point".into()), name: "next".into() });
        assert_eq!(point.methods.len(), 2);
        assert_eq!(point.methods[1].formals[1].ty, Type::Bool);
    }

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let expected = binary(BinaryOp::Add, int(1), binary(BinaryOp::Mul, int(2), int(3)));
        assert_eq!(expr_of("1 + 2 * 3"), expected);

        // a < b && !c || d
        let parsed = expr_of("a < b && !c || d");
        let ExprKind::Binary { op: BinaryOp::Or, left, .. } = parsed.kind else { panic!("expected ||") };
        let ExprKind::Binary { op: BinaryOp::And, left: rel, right: not } = left.kind else {
            panic!("expected &&")
        };
        assert!(matches!(rel.kind, ExprKind::Binary { op: BinaryOp::Lt, .. }));
        assert!(matches!(not.kind, ExprKind::Unary { op: UnaryOp::Not, .. }));
    }

    #[test]
    fn test_subtraction_is_left_associative() {
        let expected = binary(BinaryOp::Sub, binary(BinaryOp::Sub, int(8), int(4)), int(2));
        assert_eq!(expr_of("8 - 4 - 2"), expected);
    }

    #[test]
    fn test_postfix_chains() {
        let parsed = expr_of("new A().b.f(1, this)");
        let ExprKind::Call { callee: Callee::Member { object, name }, args, .. } = parsed.kind else {
            panic!("expected member call")
        };
        assert_eq!(name, "f");
        assert_eq!(args.len(), 2);
        assert_eq!(args[1].kind, ExprKind::This);
        let ExprKind::Field { object: inner, field } = object.kind else { panic!("expected field") };
        assert_eq!(field, "b");
        assert_eq!(inner.kind, ExprKind::New { class: "A".into() });
    }

    #[test]
    fn test_literals_and_comments() {
        let parsed = expr_of("/* note */ \"a\\\"b\" // trailing\n");
        assert_eq!(parsed.kind, ExprKind::StrLit { value: "a\\\"b".into() });

        let parsed = expr_of("--5");
        let ExprKind::Unary { op: UnaryOp::Neg, operand } = parsed.kind else { panic!("expected -") };
        assert!(matches!(operand.kind, ExprKind::Unary { op: UnaryOp::Neg, .. }));
    }

    #[test]
    fn test_statements() {
        let program = parse(
            "class Main { Void main() { Int i;
                 while (i < 10) { readln(i); }
                 if (true) { this.f(); } else { }
                 foo(1);
                 this.i = 2;
                 return; } }",
        )
        .expect("parse");
        let statements = &program.main_class.methods[0].body.statements;
        assert!(matches!(statements[0], Statement::While { .. }));
        assert!(matches!(statements[1], Statement::If { .. }));
        assert!(matches!(statements[2], Statement::Call { .. }));
        assert!(matches!(statements[3], Statement::Assign { .. }));
        assert!(matches!(statements[4], Statement::Return { expr: None }));
    }

    #[test]
    fn test_errors_report_position() {
        let err = parse("class Main {\n  Void main() { 1 + ; }\n}").expect_err("should fail");
        assert!(err.errors[0].starts_with("2:"), "{}", err);

        assert!(parse("class Main { Void main() { 1 = 2; } }").is_err());
        assert!(parse("class Main { Void main() { Int while; } }").is_err());
    }
}
