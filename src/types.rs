/* Java object identifiers, type signatures and access flags.                 */
/* Identifiers are stored in the JNI/descriptor form, e.g. Ljava/lang/Object; */

use std::fmt;
use std::hash::{Hash, Hasher};

use bitflags::bitflags;

/// Represents a Java object identifier
///
/// # Examples
///
/// ```
///  use declass::types::ObjectIdentifier;
///
///  let o = ObjectIdentifier::from_java_type("com.basic.Test");
///  assert_eq!(o.as_java_type(), "com.basic.Test");
///  assert_eq!(o.as_jni_type(), "Lcom/basic/Test;");
/// ```
#[derive(Debug, Clone, Eq)]
pub struct ObjectIdentifier {
    jni_type: String,
}

impl PartialEq<Self> for ObjectIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.jni_type == other.jni_type
    }
}

impl Hash for ObjectIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.jni_type.hash(state);
    }
}

impl ObjectIdentifier {
    pub fn from_jni_type(t: &str) -> ObjectIdentifier {
        ObjectIdentifier {
            jni_type: t.to_string(),
        }
    }

    pub fn from_java_type(t: &str) -> ObjectIdentifier {
        let jni_type = format!("L{};", t.replace('.', "/"));
        ObjectIdentifier { jni_type }
    }

    pub fn as_jni_type(&self) -> String {
        self.jni_type.to_string()
    }

    pub fn as_java_type(&self) -> String {
        if self.jni_type.len() < 2 {
            return self.jni_type.clone();
        }
        self.jni_type[1..self.jni_type.len() - 1].replace('/', ".")
    }

    /// The class name with package and any declaring classes stripped:
    /// `La/b/C$D;` yields `D`.
    pub fn simple_name(&self) -> String {
        let java = self.as_java_type();
        let tail = java.rsplit('.').next().unwrap_or(&java);
        tail.rsplit('$').next().unwrap_or(tail).to_string()
    }

    /// The class name without package but with declaring classes:
    /// `La/b/C$D;` yields `C$D`.
    pub fn file_stem(&self) -> String {
        let java = self.as_java_type();
        java.rsplit('.').next().unwrap_or(&java).to_string()
    }

    /// Package path with `/` separators, empty for the default package.
    pub fn package_path(&self) -> String {
        let java = self.as_java_type();
        match java.rfind('.') {
            Some(ix) => java[..ix].replace('.', "/"),
            None => String::new(),
        }
    }

    pub fn package_name(&self) -> String {
        let java = self.as_java_type();
        match java.rfind('.') {
            Some(ix) => java[..ix].to_string(),
            None => String::new(),
        }
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.jni_type)
    }
}

/// Represents a Java type: array, object or primitive type
///
/// # Examples
///
/// ```
///  use declass::types::TypeSignature;
///
///  let t = TypeSignature::Bool;
///  assert_eq!(t.to_jni(), "Z");
/// ```
#[derive(Debug, Clone, Eq)]
pub enum TypeSignature {
    Array(Box<TypeSignature>),
    Object(ObjectIdentifier),
    Int,
    Bool,
    Byte,
    Char,
    Short,
    Long,
    Float,
    Double,
    Void,
}

impl PartialEq<Self> for TypeSignature {
    fn eq(&self, other: &Self) -> bool {
        self.to_jni() == other.to_jni()
    }
}

impl TypeSignature {
    pub fn from_jni(s: &str) -> TypeSignature {
        let (t, _) = Self::read(s);
        t
    }

    /// Reads one type signature from the front of `s`, returning it and the
    /// number of bytes consumed. Used when scanning method descriptors.
    pub fn read(s: &str) -> (TypeSignature, usize) {
        let bytes = s.as_bytes();
        match bytes.first() {
            Some(b'[') => {
                let (inner, used) = Self::read(&s[1..]);
                (TypeSignature::Array(Box::new(inner)), used + 1)
            }
            Some(b'Z') => (TypeSignature::Bool, 1),
            Some(b'B') => (TypeSignature::Byte, 1),
            Some(b'C') => (TypeSignature::Char, 1),
            Some(b'S') => (TypeSignature::Short, 1),
            Some(b'I') => (TypeSignature::Int, 1),
            Some(b'J') => (TypeSignature::Long, 1),
            Some(b'F') => (TypeSignature::Float, 1),
            Some(b'D') => (TypeSignature::Double, 1),
            Some(b'L') => {
                let end = s.find(';').map(|i| i + 1).unwrap_or(s.len());
                (
                    TypeSignature::Object(ObjectIdentifier::from_jni_type(&s[..end])),
                    end,
                )
            }
            _ => (TypeSignature::Void, 1),
        }
    }

    pub fn to_jni(&self) -> String {
        match self {
            TypeSignature::Array(a) => "[".to_string() + &a.to_jni(),
            TypeSignature::Bool => "Z".to_string(),
            TypeSignature::Byte => "B".to_string(),
            TypeSignature::Char => "C".to_string(),
            TypeSignature::Short => "S".to_string(),
            TypeSignature::Int => "I".to_string(),
            TypeSignature::Long => "J".to_string(),
            TypeSignature::Float => "F".to_string(),
            TypeSignature::Double => "D".to_string(),
            TypeSignature::Object(o) => o.as_jni_type(),
            TypeSignature::Void => "V".to_string(),
        }
    }

    /// Java source spelling: `[I` becomes `int[]`, objects print their
    /// simple name.
    pub fn to_java(&self) -> String {
        match self {
            TypeSignature::Array(a) => a.to_java() + "[]",
            TypeSignature::Bool => "boolean".to_string(),
            TypeSignature::Byte => "byte".to_string(),
            TypeSignature::Char => "char".to_string(),
            TypeSignature::Short => "short".to_string(),
            TypeSignature::Int => "int".to_string(),
            TypeSignature::Long => "long".to_string(),
            TypeSignature::Float => "float".to_string(),
            TypeSignature::Double => "double".to_string(),
            TypeSignature::Object(o) => o.simple_name(),
            TypeSignature::Void => "void".to_string(),
        }
    }

    /// A wide (long/double) value occupies two registers.
    pub fn is_wide(&self) -> bool {
        matches!(self, TypeSignature::Long | TypeSignature::Double)
    }
}

/// Represents a Java method signature consisting of arguments and a return type
///
/// # Examples
///
/// ```
///  use declass::types::{MethodSignature, TypeSignature};
///
///  let m = MethodSignature::from_jni("([I)V");
///  assert_eq!(m.return_type, TypeSignature::Void);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSignature {
    pub args: Vec<TypeSignature>,
    pub return_type: TypeSignature,
}

impl MethodSignature {
    pub fn from_jni(s: &str) -> MethodSignature {
        let mut args = vec![];
        let inner = s.strip_prefix('(').unwrap_or(s);
        let close = inner.find(')').unwrap_or(inner.len());
        let mut params = &inner[..close];
        while !params.is_empty() {
            let (t, used) = TypeSignature::read(params);
            args.push(t);
            params = &params[used..];
        }
        let ret = if close < inner.len() {
            TypeSignature::from_jni(&inner[close + 1..])
        } else {
            TypeSignature::Void
        };
        MethodSignature {
            args,
            return_type: ret,
        }
    }

    pub fn to_jni(&self) -> String {
        let mut s = "(".to_string();
        for t in &self.args {
            s.push_str(&t.to_jni());
        }
        s.push(')');
        s.push_str(&self.return_type.to_jni());
        s
    }

    /// Number of argument registers the call consumes (wide args take two).
    pub fn arg_registers(&self) -> usize {
        self.args
            .iter()
            .map(|t| if t.is_wide() { 2 } else { 1 })
            .sum()
    }
}

bitflags! {
    /// Class/field/method access flags shared by the DEX and class-file
    /// formats. Values follow the DEX access_flags encoding.
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const PROTECTED = 0x4;
        const STATIC = 0x8;
        const FINAL = 0x10;
        const SYNCHRONIZED = 0x20;
        const VOLATILE = 0x40;
        const BRIDGE = 0x40;
        const TRANSIENT = 0x80;
        const VARARGS = 0x80;
        const NATIVE = 0x100;
        const INTERFACE = 0x200;
        const ABSTRACT = 0x400;
        const STRICT = 0x800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x10000;
        const DECLARED_SYNCHRONIZED = 0x20000;
    }
}

/// Where a set of access flags appears; some bit values are shared between
/// contexts (volatile/bridge, transient/varargs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagContext {
    Class,
    Field,
    Method,
}

impl AccessFlags {
    pub fn from_u32(v: u32) -> AccessFlags {
        AccessFlags::from_bits_truncate(v)
    }

    /// Space-separated Java modifier keywords, with a trailing space when
    /// non-empty so callers can prepend the result to a declaration.
    pub fn java_modifiers(&self, ctx: FlagContext) -> String {
        let mut out = String::new();
        let mut push = |word: &str| {
            out.push_str(word);
            out.push(' ');
        };
        if self.contains(AccessFlags::PUBLIC) {
            push("public");
        }
        if self.contains(AccessFlags::PROTECTED) {
            push("protected");
        }
        if self.contains(AccessFlags::PRIVATE) {
            push("private");
        }
        if self.contains(AccessFlags::ABSTRACT) && ctx != FlagContext::Field {
            push("abstract");
        }
        if self.contains(AccessFlags::STATIC) {
            push("static");
        }
        if self.contains(AccessFlags::FINAL) {
            push("final");
        }
        match ctx {
            FlagContext::Field => {
                if self.contains(AccessFlags::VOLATILE) {
                    push("volatile");
                }
                if self.contains(AccessFlags::TRANSIENT) {
                    push("transient");
                }
            }
            FlagContext::Method => {
                if self.contains(AccessFlags::SYNCHRONIZED)
                    || self.contains(AccessFlags::DECLARED_SYNCHRONIZED)
                {
                    push("synchronized");
                }
                if self.contains(AccessFlags::NATIVE) {
                    push("native");
                }
                if self.contains(AccessFlags::STRICT) {
                    push("strictfp");
                }
            }
            FlagContext::Class => {}
        }
        out
    }

    /// Smali modifier keywords in the order the smali tools print them.
    pub fn smali_modifiers(&self, ctx: FlagContext) -> String {
        let mut out = self.java_modifiers(ctx);
        if ctx == FlagContext::Class {
            if self.contains(AccessFlags::INTERFACE) {
                out.push_str("interface ");
            }
            if self.contains(AccessFlags::ANNOTATION) {
                out.push_str("annotation ");
            }
        }
        if self.contains(AccessFlags::SYNTHETIC) {
            out.push_str("synthetic ");
        }
        if self.contains(AccessFlags::ENUM) {
            out.push_str("enum ");
        }
        if ctx == FlagContext::Method {
            if self.contains(AccessFlags::BRIDGE) {
                out.push_str("bridge ");
            }
            if self.contains(AccessFlags::VARARGS) {
                out.push_str("varargs ");
            }
        }
        if ctx == FlagContext::Method && self.contains(AccessFlags::CONSTRUCTOR) {
            out.push_str("constructor ");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_identifier_round_trip() {
        let o = ObjectIdentifier::from_jni_type("Lcom/basic/Test;");
        assert_eq!(o.as_java_type(), "com.basic.Test");
        assert_eq!(o.simple_name(), "Test");
        assert_eq!(o.package_path(), "com/basic");
    }

    #[test]
    fn inner_class_names() {
        let o = ObjectIdentifier::from_jni_type("La/b/C$D;");
        assert_eq!(o.simple_name(), "D");
        assert_eq!(o.file_stem(), "C$D");
        assert_eq!(o.package_path(), "a/b");
    }

    #[test]
    fn default_package() {
        let o = ObjectIdentifier::from_jni_type("La;");
        assert_eq!(o.as_java_type(), "a");
        assert_eq!(o.package_path(), "");
        assert_eq!(o.simple_name(), "a");
    }

    #[test]
    fn signatures() {
        let m = MethodSignature::from_jni("([ILjava/lang/String;J)V");
        assert_eq!(m.args.len(), 3);
        assert_eq!(m.return_type, TypeSignature::Void);
        assert_eq!(m.to_jni(), "([ILjava/lang/String;J)V");
        assert_eq!(m.arg_registers(), 4);
    }

    #[test]
    fn java_spelling() {
        let t = TypeSignature::from_jni("[[Ljava/lang/String;");
        assert_eq!(t.to_java(), "String[][]");
    }

    #[test]
    fn modifiers() {
        let f = AccessFlags::from_u32(0x1 | 0x8 | 0x10);
        assert_eq!(f.java_modifiers(FlagContext::Field), "public static final ");
    }
}
