//! Dynamic value model and object protocols.
//!
//! Values are referred to through cheap `Clone` handles: clones of an
//! instance handle share one field table, so mutation through any alias is
//! visible through all of them. The polymorphic operations (truthiness,
//! rendering, comparison, method call) are free functions matching on the
//! value variant.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::rc::Rc;

use thiserror::Error;

use crate::ast::Statement;

pub const INIT_METHOD: &str = "__init__";
pub const STR_METHOD: &str = "__str__";
pub const EQUAL_METHOD: &str = "__eq__";
pub const LESS_METHOD: &str = "__lt__";
pub const ADD_METHOD: &str = "__add__";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Undefined variable '{name}'")]
    UndefinedVariable { name: String },
    #[error("Unknown field '{field}'")]
    UnknownField { field: String },
    #[error("Expected a class instance, got a value of type {type_name}")]
    ExpectedInstance { type_name: &'static str },
    #[error("Class '{class}' has no method '{method}' taking {arity} arguments")]
    UnknownMethod {
        class: String,
        method: String,
        arity: usize,
    },
    #[error("Class '{class}' defines method '{method}' more than once")]
    DuplicateMethod { class: String, method: String },
    #[error("Values of type {lhs} and {rhs} cannot be compared")]
    Incomparable {
        lhs: &'static str,
        rhs: &'static str,
    },
    #[error("Method '{method}' must return a Bool value, got {type_name}")]
    ExpectedBoolResult {
        method: &'static str,
        type_name: &'static str,
    },
    #[error("Expected a Bool value, got {type_name}")]
    ExpectedBool { type_name: &'static str },
    #[error("Unsupported operand types for '{op}': {lhs} and {rhs}")]
    UnsupportedOperands {
        op: char,
        lhs: &'static str,
        rhs: &'static str,
    },
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Integer overflow in '{op}'")]
    IntegerOverflow { op: char },
    #[error("Return outside of a method body")]
    ReturnOutsideMethod,
    #[error("Failed to write output: {0}")]
    Output(String),
}

/// Non-local control flow raised during evaluation.
///
/// `Return` is the dedicated unwind signal of a `return` statement; only
/// the method-body node consumes it. `Error` propagates to the driver.
#[derive(Debug)]
pub enum Unwind {
    Return(Value),
    Error(RuntimeError),
}

impl From<RuntimeError> for Unwind {
    fn from(error: RuntimeError) -> Self {
        Unwind::Error(error)
    }
}

pub type ExecResult = Result<Value, Unwind>;

/// Name bindings of one lexical scope.
pub type Closure = HashMap<String, Value>;

/// Capabilities the evaluator receives from the driver.
pub trait Context {
    fn output(&mut self) -> &mut dyn Write;
}

/// Context writing program output to an arbitrary sink.
pub struct SimpleContext<W> {
    output: W,
}

impl<W: Write> SimpleContext<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    pub fn into_output(self) -> W {
        self.output
    }
}

impl<W: Write> Context for SimpleContext<W> {
    fn output(&mut self) -> &mut dyn Write {
        &mut self.output
    }
}

/// Handle to a runtime value. `None` is the distinguished none handle.
#[derive(Debug, Clone)]
pub enum Value {
    Number(i64),
    String(Rc<String>),
    Bool(bool),
    Class(Rc<Class>),
    Instance(Rc<RefCell<Instance>>),
    None,
}

impl Value {
    pub fn string(text: impl Into<String>) -> Self {
        Value::String(Rc::new(text.into()))
    }

    pub fn new_instance(class: Rc<Class>) -> Self {
        Value::Instance(Rc::new(RefCell::new(Instance::new(class))))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "Number",
            Value::String(_) => "String",
            Value::Bool(_) => "Bool",
            Value::Class(_) => "Class",
            Value::Instance(_) => "ClassInstance",
            Value::None => "None",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            Value::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Rc<RefCell<Instance>>> {
        match self {
            Value::Instance(instance) => Some(instance),
            _ => None,
        }
    }
}

/// Truthiness. Classes and instances are always falsy: this is the
/// language's documented behaviour, not Python's.
pub fn is_true(value: &Value) -> bool {
    match value {
        Value::Number(value) => *value != 0,
        Value::String(text) => !text.is_empty(),
        Value::Bool(value) => *value,
        Value::Class(_) | Value::Instance(_) | Value::None => false,
    }
}

/// A method: name, formal parameter names, owned body statement.
#[derive(Debug)]
pub struct Method {
    pub name: String,
    pub formal_params: Vec<String>,
    pub body: Statement,
}

/// A class object. Immutable after construction.
#[derive(Debug)]
pub struct Class {
    name: String,
    methods: Vec<Method>,
    parent: Option<Rc<Class>>,
}

impl Class {
    /// Builds a class, rejecting duplicate method names so dispatch cannot
    /// depend on table order.
    pub fn new(
        name: impl Into<String>,
        methods: Vec<Method>,
        parent: Option<Rc<Class>>,
    ) -> Result<Self, RuntimeError> {
        let name = name.into();
        for (index, method) in methods.iter().enumerate() {
            if methods[..index].iter().any(|m| m.name == method.name) {
                return Err(RuntimeError::DuplicateMethod {
                    class: name,
                    method: method.name.clone(),
                });
            }
        }
        Ok(Self {
            name,
            methods,
            parent,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Most-derived method with the given name: the class's own table
    /// first, then the parent chain.
    pub fn get_method(&self, name: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|method| method.name == name)
            .or_else(|| self.parent.as_ref().and_then(|parent| parent.get_method(name)))
    }
}

/// A class instance: its class plus an open field table. Any method body
/// may add a field by assigning through `self`.
pub struct Instance {
    class: Rc<Class>,
    fields: Closure,
}

impl Instance {
    pub fn new(class: Rc<Class>) -> Self {
        Self {
            class,
            fields: Closure::new(),
        }
    }

    pub fn class(&self) -> Rc<Class> {
        Rc::clone(&self.class)
    }

    pub fn fields(&self) -> &Closure {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut Closure {
        &mut self.fields
    }

    /// True iff the class chain has a method of this name whose formal
    /// parameter count equals `arity`.
    pub fn has_method(&self, method: &str, arity: usize) -> bool {
        self.class
            .get_method(method)
            .is_some_and(|m| m.formal_params.len() == arity)
    }
}

impl fmt::Debug for Instance {
    // Field tables may contain reference cycles, so the derived recursive
    // format is unusable here.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instance of '{}'", self.class.name())
    }
}

/// Calls `method` on the receiver: builds a fresh closure binding `self`
/// and the formal parameters, then executes the method body. Requires a
/// method of exactly matching arity.
pub fn call_method(
    receiver: &Rc<RefCell<Instance>>,
    method: &str,
    args: Vec<Value>,
    context: &mut dyn Context,
) -> ExecResult {
    let class = receiver.borrow().class();
    let found = class
        .get_method(method)
        .filter(|m| m.formal_params.len() == args.len());
    let Some(resolved) = found else {
        return Err(RuntimeError::UnknownMethod {
            class: class.name().to_string(),
            method: method.to_string(),
            arity: args.len(),
        }
        .into());
    };

    let mut closure = Closure::new();
    closure.insert("self".to_string(), Value::Instance(Rc::clone(receiver)));
    for (param, arg) in resolved.formal_params.iter().zip(args) {
        closure.insert(param.clone(), arg);
    }
    resolved.body.execute(&mut closure, context)
}

/// Printed form of a value. Instances delegate to a zero-argument
/// `__str__` when the class defines one; otherwise the form embeds the
/// handle address.
pub fn render_value(value: &Value, context: &mut dyn Context) -> Result<String, Unwind> {
    match value {
        Value::Number(value) => Ok(value.to_string()),
        Value::String(text) => Ok(text.as_ref().clone()),
        Value::Bool(true) => Ok("True".to_string()),
        Value::Bool(false) => Ok("False".to_string()),
        Value::Class(class) => Ok(format!("Class {}", class.name())),
        Value::None => Ok("None".to_string()),
        Value::Instance(instance) => {
            if instance.borrow().has_method(STR_METHOD, 0) {
                let result = call_method(instance, STR_METHOD, Vec::new(), context)?;
                render_value(&result, context)
            } else {
                let class = instance.borrow().class();
                Ok(format!(
                    "<{} object at {:p}>",
                    class.name(),
                    Rc::as_ptr(instance)
                ))
            }
        }
    }
}

pub fn equal(lhs: &Value, rhs: &Value, context: &mut dyn Context) -> Result<bool, Unwind> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => Ok(a == b),
        (Value::String(a), Value::String(b)) => Ok(a == b),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        (Value::None, Value::None) => Ok(true),
        (Value::Instance(instance), _) if instance.borrow().has_method(EQUAL_METHOD, 1) => {
            dunder_compare(instance, EQUAL_METHOD, rhs, context)
        }
        _ => Err(RuntimeError::Incomparable {
            lhs: lhs.type_name(),
            rhs: rhs.type_name(),
        }
        .into()),
    }
}

pub fn less(lhs: &Value, rhs: &Value, context: &mut dyn Context) -> Result<bool, Unwind> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => Ok(a < b),
        (Value::String(a), Value::String(b)) => Ok(a < b),
        (Value::Bool(a), Value::Bool(b)) => Ok(a < b),
        (Value::Instance(instance), _) if instance.borrow().has_method(LESS_METHOD, 1) => {
            dunder_compare(instance, LESS_METHOD, rhs, context)
        }
        _ => Err(RuntimeError::Incomparable {
            lhs: lhs.type_name(),
            rhs: rhs.type_name(),
        }
        .into()),
    }
}

pub fn not_equal(lhs: &Value, rhs: &Value, context: &mut dyn Context) -> Result<bool, Unwind> {
    Ok(!equal(lhs, rhs, context)?)
}

pub fn greater(lhs: &Value, rhs: &Value, context: &mut dyn Context) -> Result<bool, Unwind> {
    Ok(!less(lhs, rhs, context)? && !equal(lhs, rhs, context)?)
}

pub fn less_or_equal(lhs: &Value, rhs: &Value, context: &mut dyn Context) -> Result<bool, Unwind> {
    Ok(!greater(lhs, rhs, context)?)
}

pub fn greater_or_equal(
    lhs: &Value,
    rhs: &Value,
    context: &mut dyn Context,
) -> Result<bool, Unwind> {
    Ok(!less(lhs, rhs, context)?)
}

fn dunder_compare(
    receiver: &Rc<RefCell<Instance>>,
    method: &'static str,
    rhs: &Value,
    context: &mut dyn Context,
) -> Result<bool, Unwind> {
    let result = call_method(receiver, method, vec![rhs.clone()], context)?;
    match result {
        Value::Bool(flag) => Ok(flag),
        other => Err(RuntimeError::ExpectedBoolResult {
            method,
            type_name: other.type_name(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Statement;

    fn context() -> SimpleContext<Vec<u8>> {
        SimpleContext::new(Vec::new())
    }

    fn empty_class(name: &str) -> Rc<Class> {
        Rc::new(Class::new(name, Vec::new(), None).expect("class builds"))
    }

    fn method(name: &str, params: &[&str], body: Statement) -> Method {
        Method {
            name: name.to_string(),
            formal_params: params.iter().map(|p| p.to_string()).collect(),
            body: Statement::MethodBody(Box::new(body)),
        }
    }

    fn returning(value: Statement) -> Statement {
        Statement::Return(Box::new(value))
    }

    #[test]
    fn truthiness_table() {
        assert!(!is_true(&Value::Number(0)));
        assert!(is_true(&Value::Number(57)));
        assert!(is_true(&Value::Number(-1)));
        assert!(!is_true(&Value::string("")));
        assert!(is_true(&Value::string("123")));
        assert!(is_true(&Value::Bool(true)));
        assert!(!is_true(&Value::Bool(false)));
        assert!(!is_true(&Value::None));
        let class = empty_class("A");
        assert!(!is_true(&Value::Class(Rc::clone(&class))));
        assert!(!is_true(&Value::new_instance(class)));
    }

    #[test]
    fn compares_primitives_by_value() {
        let mut ctx = context();
        assert!(equal(&Value::Number(3), &Value::Number(3), &mut ctx).expect("equal"));
        assert!(!equal(&Value::Number(3), &Value::Number(4), &mut ctx).expect("equal"));
        assert!(less(&Value::Number(3), &Value::Number(4), &mut ctx).expect("less"));
        assert!(equal(&Value::string("ab"), &Value::string("ab"), &mut ctx).expect("equal"));
        assert!(less(&Value::string("abc"), &Value::string("abd"), &mut ctx).expect("less"));
        assert!(less(&Value::Bool(false), &Value::Bool(true), &mut ctx).expect("less"));
        assert!(equal(&Value::None, &Value::None, &mut ctx).expect("equal"));
    }

    #[test]
    fn derived_predicates_compose() {
        let mut ctx = context();
        let two = Value::Number(2);
        let three = Value::Number(3);
        assert!(not_equal(&two, &three, &mut ctx).expect("not_equal"));
        assert!(greater(&three, &two, &mut ctx).expect("greater"));
        assert!(!greater(&two, &two, &mut ctx).expect("greater"));
        assert!(less_or_equal(&two, &two, &mut ctx).expect("less_or_equal"));
        assert!(greater_or_equal(&three, &two, &mut ctx).expect("greater_or_equal"));
    }

    #[test]
    fn incompatible_values_cannot_be_compared() {
        let mut ctx = context();
        let err = equal(&Value::Number(1), &Value::string("1"), &mut ctx)
            .expect_err("expected comparison failure");
        assert!(matches!(
            err,
            Unwind::Error(RuntimeError::Incomparable { .. })
        ));
        let err =
            less(&Value::None, &Value::None, &mut ctx).expect_err("none has no ordering");
        assert!(matches!(
            err,
            Unwind::Error(RuntimeError::Incomparable { .. })
        ));
    }

    #[test]
    fn instance_comparison_delegates_to_dunder_methods() {
        let class = Rc::new(
            Class::new(
                "Flag",
                vec![
                    method("__eq__", &["other"], returning(Statement::BoolLiteral(true))),
                    method("__lt__", &["other"], returning(Statement::BoolLiteral(false))),
                ],
                None,
            )
            .expect("class builds"),
        );
        let mut ctx = context();
        let lhs = Value::new_instance(Rc::clone(&class));
        assert!(equal(&lhs, &Value::Number(0), &mut ctx).expect("delegated equal"));
        assert!(!less(&lhs, &Value::Number(0), &mut ctx).expect("delegated less"));
        // greater = !less && !equal
        assert!(!greater(&lhs, &Value::Number(0), &mut ctx).expect("delegated greater"));
    }

    #[test]
    fn dunder_comparison_must_return_bool() {
        let class = Rc::new(
            Class::new(
                "Odd",
                vec![method(
                    "__eq__",
                    &["other"],
                    returning(Statement::NumberLiteral(1)),
                )],
                None,
            )
            .expect("class builds"),
        );
        let mut ctx = context();
        let lhs = Value::new_instance(class);
        let err = equal(&lhs, &Value::Number(0), &mut ctx).expect_err("expected type failure");
        assert!(matches!(
            err,
            Unwind::Error(RuntimeError::ExpectedBoolResult { .. })
        ));
    }

    #[test]
    fn method_resolution_prefers_the_derived_class() {
        let parent = Rc::new(
            Class::new(
                "Base",
                vec![
                    method("m", &[], returning(Statement::NumberLiteral(1))),
                    method("only_base", &[], returning(Statement::NumberLiteral(3))),
                ],
                None,
            )
            .expect("class builds"),
        );
        let child = Class::new(
            "Derived",
            vec![method("m", &[], returning(Statement::NumberLiteral(2)))],
            Some(Rc::clone(&parent)),
        )
        .expect("class builds");

        let resolved = child.get_method("m").expect("m resolves");
        assert!(matches!(
            resolved.body,
            Statement::MethodBody(ref inner)
                if matches!(**inner, Statement::Return(ref v)
                    if matches!(**v, Statement::NumberLiteral(2)))
        ));
        assert!(child.get_method("only_base").is_some());
        assert!(child.get_method("missing").is_none());
    }

    #[test]
    fn duplicate_method_names_are_rejected() {
        let err = Class::new(
            "X",
            vec![
                method("f", &["a"], Statement::NoneLiteral),
                method("f", &["a", "b"], Statement::NoneLiteral),
            ],
            None,
        )
        .expect_err("expected duplicate rejection");
        assert_eq!(
            err,
            RuntimeError::DuplicateMethod {
                class: "X".to_string(),
                method: "f".to_string(),
            }
        );
    }

    #[test]
    fn has_method_checks_arity() {
        let class = Rc::new(
            Class::new(
                "A",
                vec![method("f", &["x"], Statement::NoneLiteral)],
                None,
            )
            .expect("class builds"),
        );
        let instance = Instance::new(class);
        assert!(instance.has_method("f", 1));
        assert!(!instance.has_method("f", 0));
        assert!(!instance.has_method("g", 0));
    }

    #[test]
    fn call_with_wrong_arity_fails() {
        let class = Rc::new(
            Class::new(
                "A",
                vec![method("f", &["x"], Statement::NoneLiteral)],
                None,
            )
            .expect("class builds"),
        );
        let receiver = Rc::new(RefCell::new(Instance::new(class)));
        let mut ctx = context();
        let err = call_method(&receiver, "f", Vec::new(), &mut ctx)
            .expect_err("expected dispatch failure");
        assert!(matches!(
            err,
            Unwind::Error(RuntimeError::UnknownMethod { arity: 0, .. })
        ));
    }

    #[test]
    fn instance_handles_alias_one_field_table() {
        let class = empty_class("A");
        let first = Value::new_instance(class);
        let second = first.clone();
        if let Value::Instance(instance) = &first {
            instance
                .borrow_mut()
                .fields_mut()
                .insert("n".to_string(), Value::Number(7));
        }
        let observed = second
            .as_instance()
            .expect("second is an instance")
            .borrow()
            .fields()
            .get("n")
            .and_then(Value::as_number);
        assert_eq!(observed, Some(7));
    }

    #[test]
    fn renders_primitives_classes_and_none() {
        let mut ctx = context();
        assert_eq!(render_value(&Value::Number(-8), &mut ctx).expect("render"), "-8");
        assert_eq!(render_value(&Value::string("hi"), &mut ctx).expect("render"), "hi");
        assert_eq!(render_value(&Value::Bool(true), &mut ctx).expect("render"), "True");
        assert_eq!(render_value(&Value::Bool(false), &mut ctx).expect("render"), "False");
        assert_eq!(render_value(&Value::None, &mut ctx).expect("render"), "None");
        let class = empty_class("Point");
        assert_eq!(
            render_value(&Value::Class(Rc::clone(&class)), &mut ctx).expect("render"),
            "Class Point"
        );
        let rendered = render_value(&Value::new_instance(class), &mut ctx).expect("render");
        assert!(rendered.starts_with("<Point object at "));
    }

    #[test]
    fn instance_rendering_delegates_to_str_method() {
        let class = Rc::new(
            Class::new(
                "Named",
                vec![method(
                    "__str__",
                    &[],
                    returning(Statement::StringLiteral("custom".to_string())),
                )],
                None,
            )
            .expect("class builds"),
        );
        let mut ctx = context();
        let rendered = render_value(&Value::new_instance(class), &mut ctx).expect("render");
        assert_eq!(rendered, "custom");
    }
}
