use crate::arena::ExprArena;
use crate::dex::class::SourceFile;
use crate::dex::image::DexImage;
use crate::java::decompile_source_file;
use crate::smali;
use crate::testutil::{single_class_dex, CodeBlob, DexBuilder};

fn decompile(bytes: Vec<u8>) -> String {
    let image = DexImage::parse(bytes).unwrap();
    let sf = SourceFile::build(&image, 0).unwrap();
    let mut arena = ExprArena::new();
    decompile_source_file(&sf, &mut arena).unwrap()
}

#[test]
fn empty_void_method_elides_return() {
    let src = decompile(single_class_dex());
    assert!(src.contains("public void m() { }"), "got:\n{src}");
}

#[test]
fn smali_body_of_trivial_method() {
    let image = DexImage::parse(single_class_dex()).unwrap();
    let smali = smali::write_class(&image, 0).unwrap();
    assert!(
        smali.contains("    .registers 1\n    return-void\n"),
        "got:\n{smali}"
    );
}

fn static_int_method(insns: Vec<u16>, registers: u16) -> Vec<u8> {
    let mut b = DexBuilder::new();
    let proto = b.add_proto("I", "I", &[]);
    let method = b.add_method("La;", proto, "calc");
    let class = b.add_class("La;", 0x1);
    b.add_direct_method(
        class,
        method,
        0x9, // public static
        Some(CodeBlob {
            registers,
            ins: 0,
            outs: 0,
            insns,
        }),
    );
    b.build()
}

#[test]
fn constants_fold_through_addition() {
    // const/4 v0, #2; const/4 v1, #3; add-int v0, v0, v1; return v0
    let src = decompile(static_int_method(
        vec![0x2012, 0x3112, 0x0090, 0x0100, 0x000f],
        2,
    ));
    assert!(src.contains("return 5;"), "got:\n{src}");
}

#[test]
fn add_zero_collapses() {
    // const/4 v0, #7; add-int/lit8 v0, v0, #0; return v0
    let src = decompile(static_int_method(vec![0x7012, 0x00d8, 0x0000, 0x000f], 1));
    assert!(src.contains("return 7;"), "got:\n{src}");
}

#[test]
fn branch_folds_to_if() {
    // 0: const/4 v0, #1
    // 1: if-eqz v0, +3 (-> 4)
    // 3: return v0
    // 4: const/4 v0, #2
    // 5: return v0
    let src = decompile(static_int_method(
        vec![0x1012, 0x0038, 0x0003, 0x000f, 0x2012, 0x000f],
        1,
    ));
    assert!(src.contains("if (v0 != 0)"), "got:\n{src}");
    assert!(src.contains("v0 = 2;"), "got:\n{src}");
    assert!(!src.contains("goto"), "all jumps should fold:\n{src}");
}

/// `static int cmp(float p0, float p1)` whose body is one three-way float
/// comparison (the given opcode) into v0, then `return v0`.
fn float_cmp_method(cmp_unit: u16) -> Vec<u8> {
    let mut b = DexBuilder::new();
    let proto = b.add_proto("IFF", "I", &["F", "F"]);
    let method = b.add_method("La;", proto, "cmp");
    let class = b.add_class("La;", 0x1);
    b.add_direct_method(
        class,
        method,
        0x9, // public static
        Some(CodeBlob {
            registers: 2,
            ins: 2,
            outs: 0,
            // cmp?-float v0, v0, v1; return v0
            insns: vec![cmp_unit, 0x0100, 0x000f],
        }),
    );
    b.build()
}

#[test]
fn cmpg_float_keeps_nan_bias() {
    let src = decompile(float_cmp_method(0x002e)); // cmpg-float
    assert!(
        src.contains("(Float.isNaN(p0) || Float.isNaN(p1)) ? 1 : Float.compare(p0, p1)"),
        "got:\n{src}"
    );
}

#[test]
fn cmpl_float_keeps_nan_bias() {
    let src = decompile(float_cmp_method(0x002d)); // cmpl-float
    assert!(
        src.contains("(Float.isNaN(p0) || Float.isNaN(p1)) ? -1 : Float.compare(p0, p1)"),
        "got:\n{src}"
    );
}

#[test]
fn unknown_opcode_produces_stub_and_spares_peers() {
    let mut b = DexBuilder::new();
    let proto = b.add_proto("V", "V", &[]);
    let good = b.add_method("La;", proto, "good");
    let bad = b.add_method("La;", proto, "bad");
    let class = b.add_class("La;", 0x1);
    b.add_direct_method(
        class,
        good,
        0x9,
        Some(CodeBlob {
            registers: 1,
            ins: 0,
            outs: 0,
            insns: vec![0x000e],
        }),
    );
    b.add_direct_method(
        class,
        bad,
        0x9,
        Some(CodeBlob {
            registers: 1,
            ins: 0,
            outs: 0,
            // 0x73 is unassigned
            insns: vec![0x0073, 0x000e],
        }),
    );

    let src = decompile(b.build());
    assert!(src.contains("public static void good() { }"), "got:\n{src}");
    assert!(src.contains("unknown opcode"), "got:\n{src}");
    // The stub carries the body as commented smali.
    assert!(src.contains("// .registers 1"), "got:\n{src}");
    assert!(src.contains("// # undecodable unit 0x0073"), "got:\n{src}");
}

#[test]
fn string_and_invoke_lift() {
    // static void say(): v0 = "hi"; String.valueOf(v0) discarded; return
    let mut b = DexBuilder::new();
    let say_proto = b.add_proto("V", "V", &[]);
    let val_proto = b.add_proto(
        "LL",
        "Ljava/lang/String;",
        &["Ljava/lang/Object;"],
    );
    let say = b.add_method("La;", say_proto, "say");
    let value_of = b.add_method("Ljava/lang/String;", val_proto, "valueOf");
    b.intern_string("hi");
    let class = b.add_class("La;", 0x1);
    let hi = b.intern_string("hi");
    b.add_direct_method(
        class,
        say,
        0x9,
        Some(CodeBlob {
            registers: 1,
            ins: 0,
            outs: 1,
            insns: vec![
                0x001a, hi as u16,      // const-string v0, "hi"
                0x1071, value_of as u16, 0x0000, // invoke-static {v0}
                0x000e,                 // return-void
            ],
        }),
    );

    let src = decompile(b.build());
    assert!(src.contains("String.valueOf(\"hi\");"), "got:\n{src}");
}

#[test]
fn new_instance_fuses_with_constructor() {
    // static Object make(): new-instance v0, Ljava/lang/Object;
    //                       invoke-direct {v0}, <init>; return-object v0
    let mut b = DexBuilder::new();
    let make_proto = b.add_proto("L", "Ljava/lang/Object;", &[]);
    let init_proto = b.add_proto("V", "V", &[]);
    let make = b.add_method("La;", make_proto, "make");
    let init = b.add_method("Ljava/lang/Object;", init_proto, "<init>");
    let class = b.add_class("La;", 0x1);
    let obj_ty = b.intern_type("Ljava/lang/Object;");
    b.add_direct_method(
        class,
        make,
        0x9,
        Some(CodeBlob {
            registers: 1,
            ins: 0,
            outs: 1,
            insns: vec![
                0x0022, obj_ty as u16,        // new-instance v0
                0x1070, init as u16, 0x0000,  // invoke-direct {v0} <init>
                0x0011,                       // return-object v0
            ],
        }),
    );

    let src = decompile(b.build());
    assert!(src.contains("return new Object();"), "got:\n{src}");
}
