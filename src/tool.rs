//! Typed tools and JSON-schema generation.
//!
//! A [`Tool`] exposes a schema and runs on raw JSON arguments. The
//! [`func`] constructor wraps a plain async function with serde-typed input
//! and output; its parameter schema is declared with the [`Parameters`] /
//! [`Property`] builder.

use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client::Error;

/// A tool the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    /// Run the tool on a raw JSON argument object, returning raw JSON
    /// output.
    async fn run(&self, args: &str) -> Result<String, Error>;
}

/// A tool's JSON schema specification.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolSchema {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

/// The function details for a tool.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: Parameters,
}

/// The parameters schema for a tool: a JSON-schema object.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct Parameters {
    #[serde(rename = "type")]
    kind: ObjectKind,
    pub properties: BTreeMap<String, Property>,
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct ObjectKind;

impl Serialize for ObjectKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("object")
    }
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named property. A property marked [`Property::required`] is
    /// also recorded in the `required` list.
    pub fn property(mut self, name: impl Into<String>, property: Property) -> Self {
        let name = name.into();
        if property.required {
            self.required.push(name.clone());
        }
        self.properties.insert(name, property);
        self
    }
}

/// A single property in a tool schema. Recursive through `items` for
/// arrays.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Property {
    #[serde(rename = "type")]
    pub kind: PropertyKind,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Property>>,
    #[serde(skip)]
    required: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl Property {
    fn of(kind: PropertyKind) -> Self {
        Self {
            kind,
            description: String::new(),
            enum_values: Vec::new(),
            items: None,
            required: false,
        }
    }

    pub fn string() -> Self {
        Self::of(PropertyKind::String)
    }

    pub fn integer() -> Self {
        Self::of(PropertyKind::Integer)
    }

    pub fn number() -> Self {
        Self::of(PropertyKind::Number)
    }

    pub fn boolean() -> Self {
        Self::of(PropertyKind::Boolean)
    }

    pub fn object() -> Self {
        Self::of(PropertyKind::Object)
    }

    pub fn array(items: Property) -> Self {
        let mut property = Self::of(PropertyKind::Array);
        property.items = Some(Box::new(items));
        property
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn enums<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Create a typed tool from an async function with automatic JSON
/// marshaling.
///
/// Empty or missing arguments are treated as `{}`. Argument decode errors
/// surface as tool errors so the agent can feed them back to the model.
pub fn func<In, Out, F, Fut>(
    name: impl Into<String>,
    description: impl Into<String>,
    parameters: Parameters,
    run: F,
) -> Arc<dyn Tool>
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, Error>> + Send + 'static,
{
    Arc::new(Func {
        name: name.into(),
        description: description.into(),
        parameters,
        run,
        marker: PhantomData,
    })
}

struct Func<In, Out, F> {
    name: String,
    description: String,
    parameters: Parameters,
    run: F,
    marker: PhantomData<fn(In) -> Out>,
}

#[async_trait]
impl<In, Out, F, Fut> Tool for Func<In, Out, F>
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, Error>> + Send + 'static,
{
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            kind: "function".to_string(),
            function: ToolFunction {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.parameters.clone(),
            },
        }
    }

    async fn run(&self, args: &str) -> Result<String, Error> {
        let args = if args.trim().is_empty() { "{}" } else { args };
        let input: In = serde_json::from_str(args).map_err(|err| Error::ToolArguments {
            tool: self.name.clone(),
            message: err.to_string(),
        })?;
        let output = (self.run)(input).await?;
        Ok(serde_json::to_string(&output)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct AddIn {
        a: i64,
        b: i64,
    }

    fn add() -> Arc<dyn Tool> {
        func(
            "add",
            "adds two numbers",
            Parameters::new()
                .property("a", Property::integer().description("First addend").required())
                .property("b", Property::integer().description("Second addend").required()),
            |input: AddIn| async move { Ok(input.a + input.b) },
        )
    }

    #[test]
    fn schema_covers_every_kind() {
        let parameters = Parameters::new()
            .property("name", Property::string().description("a name").required())
            .property("count", Property::integer())
            .property("ratio", Property::number())
            .property("active", Property::boolean())
            .property("tags", Property::array(Property::string()))
            .property("nested", Property::array(Property::array(Property::integer())))
            .property("config", Property::object())
            .property(
                "mode",
                Property::string().enums(["fast", "slow"]).required(),
            );

        let value = serde_json::to_value(&parameters).expect("serializes");
        assert_eq!(value["type"], "object");
        assert_eq!(value["properties"]["name"]["type"], "string");
        assert_eq!(value["properties"]["name"]["description"], "a name");
        assert_eq!(value["properties"]["count"]["type"], "integer");
        assert_eq!(value["properties"]["ratio"]["type"], "number");
        assert_eq!(value["properties"]["active"]["type"], "boolean");
        assert_eq!(value["properties"]["tags"]["type"], "array");
        assert_eq!(value["properties"]["tags"]["items"]["type"], "string");
        assert_eq!(value["properties"]["nested"]["items"]["type"], "array");
        assert_eq!(value["properties"]["nested"]["items"]["items"]["type"], "integer");
        assert_eq!(value["properties"]["config"]["type"], "object");
        assert_eq!(value["properties"]["mode"]["enum"], json!(["fast", "slow"]));
        assert_eq!(value["required"], json!(["name", "mode"]));
        // Unset descriptions and enums are omitted entirely.
        assert!(value["properties"]["count"].get("description").is_none());
        assert!(value["properties"]["count"].get("enum").is_none());
    }

    #[test]
    fn tool_schema_shape() {
        let schema = add().schema();
        assert_eq!(schema.kind, "function");
        assert_eq!(schema.function.name, "add");
        let value = serde_json::to_value(&schema).expect("serializes");
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["parameters"]["required"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn run_marshals_input_and_output() {
        let out = add().run(r#"{"a":17,"b":25}"#).await.expect("runs");
        assert_eq!(out, "42");
    }

    #[tokio::test]
    async fn run_treats_empty_args_as_empty_object() {
        #[derive(Deserialize, Default)]
        struct NoArgs {}
        let tool = func(
            "ping",
            "returns pong",
            Parameters::new(),
            |_: NoArgs| async move { Ok("pong".to_string()) },
        );
        assert_eq!(tool.run("").await.expect("runs"), "\"pong\"");
        assert_eq!(tool.run("  ").await.expect("runs"), "\"pong\"");
    }

    #[tokio::test]
    async fn run_reports_argument_errors() {
        let err = add().run(r#"{"a":"x"}"#).await.expect_err("fails");
        match err {
            Error::ToolArguments { tool, .. } => assert_eq!(tool, "add"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
