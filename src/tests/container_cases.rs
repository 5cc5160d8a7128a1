use crate::dex::image::DexImage;
use crate::error::FormatError;
use crate::testutil::{minimal_dex, single_class_dex, DexBuilder};

#[test]
fn class_def_table_is_stable() {
    let mut b = DexBuilder::new();
    b.add_class("La/B;", 0x1);
    b.add_class("La/C;", 0x11);
    b.add_class("Lx/Y;", 0x1);
    let image = DexImage::parse(b.build()).unwrap();
    assert_eq!(
        image.class_def_names().unwrap(),
        vec!["La/B;", "La/C;", "Lx/Y;"]
    );
}

#[test]
fn pool_joins_resolve() {
    let mut b = DexBuilder::new();
    let proto = b.add_proto("VI", "V", &["I"]);
    let method = b.add_method("Lp/Q;", proto, "frob");
    let field = b.add_field("Lp/Q;", "Ljava/lang/String;", "tag");
    b.add_class("Lp/Q;", 0x1);
    let image = DexImage::parse(b.build()).unwrap();

    let m = image.method_ref(method).unwrap();
    assert_eq!(m.class.as_java_type(), "p.Q");
    assert_eq!(m.name, "frob");
    assert_eq!(m.sig.to_jni(), "(I)V");

    let f = image.field_ref(field).unwrap();
    assert_eq!(f.name, "tag");
    assert_eq!(f.ty.to_jni(), "Ljava/lang/String;");
}

#[test]
fn string_lookup_out_of_range() {
    let image = DexImage::parse(minimal_dex()).unwrap();
    assert!(matches!(
        image.string(0),
        Err(FormatError::BadIndex { pool: "string", .. })
    ));
}

#[test]
fn method_deltas_accumulate_across_lists() {
    let mut b = DexBuilder::new();
    let proto = b.add_proto("V", "V", &[]);
    let m0 = b.add_method("Lt/T;", proto, "a");
    let m1 = b.add_method("Lt/T;", proto, "b");
    let m2 = b.add_method("Lt/T;", proto, "c");
    let class = b.add_class("Lt/T;", 0x1);
    b.add_direct_method(class, m0, 0x1, None);
    b.add_direct_method(class, m1, 0x1, None);
    b.add_direct_method(class, m2, 0x1, None);
    let image = DexImage::parse(b.build()).unwrap();

    let data = image.class_data(0).unwrap().unwrap();
    let ids: Vec<u32> = data.direct_methods.iter().map(|m| m.method_idx).collect();
    assert_eq!(ids, vec![m0, m1, m2]);
}

#[test]
fn inner_and_anonymous_classification() {
    let mut b = DexBuilder::new();
    b.add_class("Lp/C;", 0x1);
    b.add_class("Lp/C$D;", 0x1);
    b.add_class("Lp/C$1;", 0x1);
    let image = DexImage::parse(b.build()).unwrap();

    assert!(!image.is_inner_class(&image.class_defs[0]));
    assert!(image.is_inner_class(&image.class_defs[1]));
    assert!(!image.is_anonymous_class(&image.class_defs[1]));
    assert!(image.is_inner_class(&image.class_defs[2]));
    assert!(image.is_anonymous_class(&image.class_defs[2]));
}

#[test]
fn source_file_mismatch_marks_inner() {
    let mut b = DexBuilder::new();
    let c = b.add_class("Lp/C;", 0x1);
    b.set_source_file(c, "Other.java");
    let image = DexImage::parse(b.build()).unwrap();
    assert!(image.is_inner_class(&image.class_defs[0]));
}

#[test]
fn dump_lists_classes_and_members() {
    let image = DexImage::parse(single_class_dex()).unwrap();
    let mut out = Vec::new();
    image.dump(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("class defs   : 1"));
    assert!(text.contains("Class #0: La;"));
    assert!(text.contains("method     : m()V"));
}
