//! End-to-end tests: source text through the whole pipeline and onto
//! the reference machine.

use regal_compiler::bytecode::Op;
use regal_compiler::errors::{CompileError, Error, RuntimeError, SemanticError};
use regal_compiler::machine::{Execution, Machine};
use regal_compiler::scope::ScopeTree;

fn run(src: &str) -> (ScopeTree, Execution) {
    regal_compiler::run(src).expect("program failed")
}

/// Value of a program variable after the run.
fn var(tree: &ScopeTree, exec: &Execution, name: &str) -> i32 {
    let var = tree.root().local(name).expect("no such variable");
    exec.registers[var.offset]
}

// ── Arithmetic ──────────────────────────────────────────────────────

#[test]
fn test_integer_addition() {
    let (_, exec) = run("[ count: int = 100; [ inc: int = 10; count = count + inc");
    assert_eq!(exec.registers.len(), 2);
    assert_eq!(exec.registers[0], 110);
}

#[test]
fn test_integer_subtraction() {
    let (tree, exec) = run("[ a: int = 100;\n[ b: int = 30;\n[ result: int = 0;\nresult = a - b");
    assert_eq!(var(&tree, &exec, "result"), 70);
}

#[test]
fn test_integer_multiplication_and_division() {
    let (tree, exec) = run("[ a: int = 7; [ b: int = 6; [ result: int = 0; result = a * b");
    assert_eq!(var(&tree, &exec, "result"), 42);

    let (tree, exec) = run("[ a: int = 100; [ b: int = 20; [ result: int = 0; result = a / b");
    assert_eq!(var(&tree, &exec, "result"), 5);
}

#[test]
fn test_chained_sum() {
    let src = r#"
[ a: int = 1;
[ b: int = 2;
[ c: int = 3;
[ d: int = 4;
[ sum: int = 0;
sum = a + b + c + d
"#;
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "sum"), 10);
}

#[test]
fn test_negative_and_wide_literals() {
    let (tree, exec) = run("[ a: int = -5; [ b: int = 100000; [ c: int = 0; c = b + a");
    assert_eq!(var(&tree, &exec, "a"), -5);
    assert_eq!(var(&tree, &exec, "c"), 99995);
}

#[test]
fn test_comparisons() {
    let src = "[ a: int = 3; [ b: int = 7; \
               [ lt: int = a < b; [ gt: int = a > b; [ eq: int = a == a; [ ne: int = a != b";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "lt"), 1);
    assert_eq!(var(&tree, &exec, "gt"), 0);
    assert_eq!(var(&tree, &exec, "eq"), 1);
    assert_eq!(var(&tree, &exec, "ne"), 1);
}

#[test]
fn test_comparisons_across_the_full_range() {
    let src = "[ a: int = -2000000000; [ b: int = 2000000000; \
               [ lt: int = a < b; [ gt: int = a > b; [ lte: int = a <= b; [ gte: int = a >= b";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "lt"), 1);
    assert_eq!(var(&tree, &exec, "gt"), 0);
    assert_eq!(var(&tree, &exec, "lte"), 1);
    assert_eq!(var(&tree, &exec, "gte"), 0);

    let src = "[ a: int = 0; [ b: int = 0x80000000; [ eq: int = a == b; [ ne: int = a != b; \
               [ gt: int = a > b";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "b"), i32::MIN);
    assert_eq!(var(&tree, &exec, "eq"), 0);
    assert_eq!(var(&tree, &exec, "ne"), 1);
    assert_eq!(var(&tree, &exec, "gt"), 1);
}

#[test]
fn test_control_on_minimum_condition() {
    let (tree, exec) = run("[ x: int = 0x80000000; [ r: int = 0; r = x ? (1, 2)");
    assert_eq!(var(&tree, &exec, "r"), 1);

    let (tree, exec) = run("[ x: int = 0; [ r: int = 0; r = x ? (1, 2)");
    assert_eq!(var(&tree, &exec, "r"), 2);
}

#[test]
fn test_logic_on_wide_values() {
    let src = "[ x: int = 0x80000000; [ y: int = 0; [ n: int = !x; [ o: int = x | y; \
        [ a: int = x & y";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "n"), 0);
    assert_eq!(var(&tree, &exec, "o"), 1);
    assert_eq!(var(&tree, &exec, "a"), 0);
}

// ── Data ────────────────────────────────────────────────────────────

#[test]
fn test_array_declaration() {
    let (_, exec) = run(": numbers = int 3;\n[ arr: numbers = (0, 1, 2)");
    assert_eq!(exec.registers, vec![0, 1, 2]);
}

#[test]
fn test_struct_declaration() {
    let (_, exec) = run(": point = (x: int, y: int);\n[ p: point = (x: 10, y: 20)");
    assert_eq!(exec.registers, vec![10, 20]);
}

#[test]
fn test_field_access() {
    let src = ": point = (x: int, y: int); [ p: point = (x: 10, y: 20); [ s: int = 0; \
        s = p.x + p.y";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "s"), 30);
}

#[test]
fn test_string_declaration() {
    let (_, exec) = run(": string = char 32;\n[ greeting: string = \"Hello, Kung!\"");
    assert_eq!(exec.registers.len(), 8);
    assert_eq!(exec.registers[0] & 0xff, 'H' as i32);
    assert_eq!((exec.registers[0] >> 8) & 0xff, 'e' as i32);
    assert_eq!(exec.registers[1] & 0xff, 'o' as i32);
}

#[test]
fn test_character_literal() {
    let (tree, exec) = run("[ c: char = \"A\";\n[ value: int = 0;\nvalue = c");
    assert_eq!(var(&tree, &exec, "value"), 65);
}

// ── Printing ────────────────────────────────────────────────────────

#[test]
fn test_hello_world() {
    let (_, exec) = run("print # \"Hello, World!\"");
    assert!(exec.registers.is_empty());
    assert_eq!(exec.output, "Hello, World!");
}

#[test]
fn test_print_variable() {
    let src = ": string = char 32;\n[ greeting: string = \"Testing!\";\nprint # greeting";
    let (_, exec) = run(src);
    assert_eq!(exec.output, "Testing!");
}

// ── Functions ───────────────────────────────────────────────────────

#[test]
fn test_simple_function() {
    let (tree, exec) = run("[ double: int > int = \\x > x * 2; [ result: int = 0; \
        result = double(21)");
    assert_eq!(var(&tree, &exec, "result"), 42);
}

#[test]
fn test_compound_body() {
    let src = r"
[ process: int > int = \x > {
    [ temp: int = x * 2;
    temp + 10
};
[ result: int = 0;
result = process # 5
";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "result"), 20);
}

#[test]
fn test_closure_capture() {
    let src = "[ base: int = 10; [ add_to_base: int > int = \\x > base + x; [ result: int = 0; \
        result = add_to_base # 5";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "result"), 15);
}

#[test]
fn test_closure_as_parameter() {
    let src = r"
[ apply: (int > int) > int > int = \f > \x > f # x;
[ double: int > int = \x > x * 2;
[ applied: int > int = apply # double;
[ result: int = 0;
result = applied # 7
";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "result"), 14);
}

#[test]
fn test_nested_functions() {
    let src = r"
[ outerFn: int > int = \x > {
    [ innerFn: int > int = \y > x * y;
    innerFn # 2
};
[ result: int = 0;
result = outerFn # 5
";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "result"), 10);
}

#[test]
fn test_multi_level_nested_functions() {
    let src = r"
[ level1: int > int = \x > {
    [ level2: int > int = \y > {
        [ level3: int > int = \z > x * y * z;
        level3 # 3
    };
    level2 # 2
};
[ result: int = 0;
result = level1 # 5
";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "result"), 30);
}

#[test]
fn test_returning_nested_function() {
    let src = r"
[ makeAdder: int > int > int = \base > {
    \x > base + x
};
[ add5: int > int = makeAdder # 5;
[ result: int = 0;
result = add5 # 10
";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "result"), 15);
}

#[test]
fn test_multiple_capture_contexts() {
    let src = r"
[ x: int = 10;
[ y: int = 20;
[ makeMultiplier: int > int > int = \factor > {
    \n > x * y * factor * n
};
[ multiply: int > int = makeMultiplier # 2;
[ result: int = 0;
result = multiply # 3
";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "result"), 1200);
}

#[test]
fn test_captured_variable_persists_across_calls() {
    let src = r"
[ counter: int = 0;
[ increment: int > int = \step > {
    counter = counter + step;
    counter
};
[ first: int = increment # 1;
[ second: int = increment # 2;
[ third: int = increment # 3
";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "first"), 1);
    assert_eq!(var(&tree, &exec, "second"), 3);
    assert_eq!(var(&tree, &exec, "third"), 6);
    // The closure holds its own copy.
    assert_eq!(var(&tree, &exec, "counter"), 0);
}

#[test]
fn test_partial_application() {
    let src = r"
[ add3: int > int > int > int = \a > \b > \c > a + b + c;
[ partialAdd: int > int > int = add3 # 5;
[ morePartial: int > int = partialAdd # 10;
[ result: int = 0;
result = morePartial # 15
";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "result"), 30);
}

#[test]
fn test_function_stored_in_struct() {
    let src = r"
: transformer = int > int;
: processor = (input: int, transform: transformer);
[ double: transformer = \x > x * 2;
[ process: processor = (input: 21, transform: double);
[ result: int = 0;
result = process.transform # process.input
";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "result"), 42);
}

#[test]
fn test_recursion_through_control() {
    let src = r"
[ sumToN: int > int = \n > {
    [ result: int = 0;
    result = (n == 0) ? (0, n + (sumToN # (n - 1)));
    result
};
[ result: int = sumToN # 5
";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "result"), 15);
}

#[test]
fn test_composition() {
    let src = r"
[ inc: int > int = \x > x + 1;
[ double: int > int = \x > x * 2;
[ result: int = 0;
[ composed: int > int = double • inc;
result = composed # 5
";
    let (tree, exec) = run(src);
    assert_eq!(var(&tree, &exec, "result"), 12);
}

#[test]
fn test_composition_leaves_no_residual_operator() {
    let src = "[ inc: int > int = \\x > x + 1; [ double: int > int = \\x > x * 2; \
        [ composed: int > int = double • inc";
    let (tree, program) = regal_compiler::compile(src).expect("compile failed");
    // One function per literal plus the synthesized composition.
    assert_eq!(tree.funcs().len(), 3);
    assert!(program.instructions.iter().any(|i| i.op == Op::ClosureMake));
}

// ── Failures ────────────────────────────────────────────────────────

#[test]
fn test_unknown_identifier_is_reported() {
    let err = regal_compiler::run("[ a: int = 0; a = b").unwrap_err();
    let semantic = match err {
        Error::Semantic(err) | Error::Compile(CompileError::Semantic(err)) => err,
        other => panic!("expected a semantic error, got {other:?}"),
    };
    assert!(matches!(
        semantic,
        SemanticError::UnknownIdentifier { ref name, .. } if name == "b"
    ));
}

#[test]
fn test_string_too_large_is_reported() {
    assert!(regal_compiler::run("[ s: char 4 = \"ab\"").is_ok());
    let err = regal_compiler::run("[ s: char 4 = \"abc\"").unwrap_err();
    assert!(matches!(
        err,
        Error::Compile(CompileError::LiteralTooLarge {
            length: 3,
            capacity: 4,
            ..
        })
    ));
}

#[test]
fn test_error_renders_with_source() {
    let src = "[ a: int = 0; a = b";
    let err = regal_compiler::run(src).unwrap_err();
    let rendered = err.with_source(src);
    assert_eq!(rendered.src, src);
    assert!(rendered.message.contains('b'));
}

#[test]
fn test_runtime_division_by_zero() {
    let err = regal_compiler::run("[ a: int = 0; [ b: int = 1; [ r: int = 0; \
        r = b / a").unwrap_err();
    assert_eq!(err, Error::Runtime(RuntimeError { status: -4 }));
}

#[test]
fn test_unbounded_recursion_hits_tick_limit() {
    let src = r"[ forever: int > int = \n > forever # n; [ r: int = forever # 1";
    let (tree, program) = regal_compiler::compile(src).expect("compile failed");
    let err = Machine::new()
        .with_tick_limit(200)
        .execute(&program, tree.root().size())
        .unwrap_err();
    assert_eq!(err.status, -1);
    assert_eq!(err.reason(), "empty program or tick limit reached");
}
