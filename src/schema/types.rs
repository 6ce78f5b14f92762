// Field registry.
//
// Each schema type is an ordered table of fields: index, name and type. The
// table is built explicitly with `SchemaBuilder`; there is no annotation
// layer. Types may reference each other (and themselves) through `TypeId`s
// handed out by `TypeRegistry::declare` before they are defined.

use super::SchemaError;
use super::value::Value;

/// Index of a schema type inside its `TypeRegistry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

// ---------------------------------------------------------------------------
// Primitive types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    String,
    /// Any integer or float.
    Number,
    Boolean,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    Bytes,
}

impl PrimitiveType {
    pub const ALL: [PrimitiveType; 14] = [
        PrimitiveType::String,
        PrimitiveType::Number,
        PrimitiveType::Boolean,
        PrimitiveType::Int8,
        PrimitiveType::Uint8,
        PrimitiveType::Int16,
        PrimitiveType::Uint16,
        PrimitiveType::Int32,
        PrimitiveType::Uint32,
        PrimitiveType::Int64,
        PrimitiveType::Uint64,
        PrimitiveType::Float32,
        PrimitiveType::Float64,
        PrimitiveType::Bytes,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            PrimitiveType::String => "string",
            PrimitiveType::Number => "number",
            PrimitiveType::Boolean => "boolean",
            PrimitiveType::Int8 => "int8",
            PrimitiveType::Uint8 => "uint8",
            PrimitiveType::Int16 => "int16",
            PrimitiveType::Uint16 => "uint16",
            PrimitiveType::Int32 => "int32",
            PrimitiveType::Uint32 => "uint32",
            PrimitiveType::Int64 => "int64",
            PrimitiveType::Uint64 => "uint64",
            PrimitiveType::Float32 => "float32",
            PrimitiveType::Float64 => "float64",
            PrimitiveType::Bytes => "bytes",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    pub const fn is_float(self) -> bool {
        matches!(self, PrimitiveType::Float32 | PrimitiveType::Float64)
    }

    pub const fn is_numeric(self) -> bool {
        !matches!(
            self,
            PrimitiveType::String | PrimitiveType::Boolean | PrimitiveType::Bytes
        )
    }

    /// True if `value` can be stored in a slot of this type.
    pub fn accepts(self, value: &Value) -> bool {
        fn int_in(value: &Value, lo: i64, hi: i64) -> bool {
            value.as_i64().is_some_and(|v| (lo..=hi).contains(&v))
        }
        fn uint_in(value: &Value, hi: u64) -> bool {
            value.as_u64().is_some_and(|v| v <= hi)
        }

        match self {
            PrimitiveType::String => matches!(value, Value::Str(_)),
            PrimitiveType::Boolean => matches!(value, Value::Bool(_)),
            PrimitiveType::Bytes => matches!(value, Value::Bytes(_)),
            PrimitiveType::Number | PrimitiveType::Float32 | PrimitiveType::Float64 => {
                matches!(value, Value::Int(_) | Value::UInt(_) | Value::Float(_))
            }
            PrimitiveType::Int8 => int_in(value, i8::MIN.into(), i8::MAX.into()),
            PrimitiveType::Int16 => int_in(value, i16::MIN.into(), i16::MAX.into()),
            PrimitiveType::Int32 => int_in(value, i32::MIN.into(), i32::MAX.into()),
            PrimitiveType::Int64 => value.as_i64().is_some(),
            PrimitiveType::Uint8 => uint_in(value, u8::MAX.into()),
            PrimitiveType::Uint16 => uint_in(value, u16::MAX.into()),
            PrimitiveType::Uint32 => uint_in(value, u32::MAX.into()),
            PrimitiveType::Uint64 => value.as_u64().is_some(),
        }
    }
}

impl PrimitiveType {
    /// Canonical stored form of `value`: integers held by float slots become
    /// floats (rounded through `f32` for `Float32`), and unsigned values that
    /// fit `i64` become `Int`.
    pub fn normalize(self, value: Value) -> Value {
        match (self, value) {
            (PrimitiveType::Float32, v) if v.as_f64().is_some() => {
                Value::Float(f64::from(v.as_f64().unwrap_or_default() as f32))
            }
            (PrimitiveType::Float64, v) if v.as_f64().is_some() => {
                Value::Float(v.as_f64().unwrap_or_default())
            }
            (_, Value::UInt(u)) => Value::from(u),
            (_, v) => v,
        }
    }
}

impl std::fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Field types
// ---------------------------------------------------------------------------

/// Member type of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildType {
    Primitive(PrimitiveType),
    Schema(TypeId),
}

impl From<PrimitiveType> for ChildType {
    fn from(p: PrimitiveType) -> Self {
        ChildType::Primitive(p)
    }
}

impl From<TypeId> for ChildType {
    fn from(t: TypeId) -> Self {
        ChildType::Schema(t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Primitive(PrimitiveType),
    /// A nested structure instance.
    Ref(TypeId),
    /// Unordered collection keyed by identity.
    Collection(ChildType),
    /// Collection that holds each value at most once.
    Set(ChildType),
}

impl FieldType {
    /// True if values in this slot are nodes (carry their own ledger).
    pub const fn is_node(self) -> bool {
        !matches!(self, FieldType::Primitive(_))
    }

    /// See [`PrimitiveType::normalize`]; node values pass through.
    pub fn normalize(self, value: Value) -> Value {
        match self {
            FieldType::Primitive(p) => p.normalize(value),
            _ => value,
        }
    }
}

impl From<PrimitiveType> for FieldType {
    fn from(p: PrimitiveType) -> Self {
        FieldType::Primitive(p)
    }
}

impl From<ChildType> for FieldType {
    fn from(c: ChildType) -> Self {
        match c {
            ChildType::Primitive(p) => FieldType::Primitive(p),
            ChildType::Schema(t) => FieldType::Ref(t),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub index: u32,
    pub name: String,
    pub ty: FieldType,
}

// ---------------------------------------------------------------------------
// Schema types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaType {
    name: String,
    fields: Vec<FieldDef>,
}

impl SchemaType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, index: u32) -> Option<&FieldDef> {
        self.fields.get(index as usize)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Builds a field table; indices follow declaration order.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    name: String,
    fields: Vec<FieldDef>,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, ty: impl Into<FieldType>) -> Self {
        let index = self.fields.len() as u32;
        self.fields.push(FieldDef {
            index,
            name: name.into(),
            ty: ty.into(),
        });
        self
    }

    pub fn build(self) -> SchemaType {
        SchemaType {
            name: self.name,
            fields: self.fields,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: Vec<Option<SchemaType>>,
    names: Vec<String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id for a type defined later (for self or mutual references).
    pub fn declare(&mut self, name: impl Into<String>) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(None);
        self.names.push(name.into());
        id
    }

    /// Provide the field table of a declared type.
    pub fn define(&mut self, id: TypeId, schema: SchemaBuilder) -> Result<(), SchemaError> {
        let slot = self
            .types
            .get_mut(id.0 as usize)
            .ok_or(SchemaError::UnknownType(id))?;
        *slot = Some(schema.build());
        Ok(())
    }

    /// Declare and define in one step.
    pub fn add(&mut self, schema: SchemaBuilder) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.names.push(schema.name.clone());
        self.types.push(Some(schema.build()));
        id
    }

    pub fn get(&self, id: TypeId) -> Result<&SchemaType, SchemaError> {
        match self.types.get(id.0 as usize) {
            Some(Some(t)) => Ok(t),
            Some(None) => Err(SchemaError::UndefinedType(
                self.names[id.0 as usize].clone(),
            )),
            None => Err(SchemaError::UnknownType(id)),
        }
    }

    pub fn by_name(&self, name: &str) -> Option<TypeId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| TypeId(i as u32))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
