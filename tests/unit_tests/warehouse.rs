use crate::unit_tests::{DiffusionKernel, TimeDerivativeKernel};
use skarn::mesh::SubdomainId;
use skarn::objects::Kernel;
use skarn::warehouse::Warehouse;
use std::sync::Arc;

fn named_kernel(name: &str) -> Arc<dyn Kernel<f64>> {
    Arc::new(DiffusionKernel {
        name: name.to_string(),
        diffusivity: 1.0,
    })
}

#[test]
fn preserves_registration_order_within_region() {
    let mut warehouse: Warehouse<SubdomainId, dyn Kernel<f64>> = Warehouse::default();
    warehouse.add_object(&[SubdomainId(0)], named_kernel("a"));
    warehouse.add_object(&[SubdomainId(0)], named_kernel("b"));
    warehouse.add_object(&[SubdomainId(0)], named_kernel("c"));

    let names: Vec<_> = warehouse
        .objects_for_region(SubdomainId(0))
        .map(|object| object.name().to_string())
        .collect();
    assert_eq!(names, ["a", "b", "c"]);
}

#[test]
fn unrestricted_objects_precede_restricted_ones() {
    let mut warehouse: Warehouse<SubdomainId, dyn Kernel<f64>> = Warehouse::default();
    warehouse.add_object(&[SubdomainId(3)], named_kernel("restricted"));
    warehouse.add_object(&[], named_kernel("global"));

    let names: Vec<_> = warehouse
        .objects_for_region(SubdomainId(3))
        .map(|object| object.name().to_string())
        .collect();
    assert_eq!(names, ["global", "restricted"]);

    // Unrestricted objects are active on regions never named explicitly.
    let names: Vec<_> = warehouse
        .objects_for_region(SubdomainId(7))
        .map(|object| object.name().to_string())
        .collect();
    assert_eq!(names, ["global"]);
}

#[test]
fn region_queries() {
    let mut warehouse: Warehouse<SubdomainId, dyn Kernel<f64>> = Warehouse::default();
    assert!(warehouse.is_empty());
    assert!(!warehouse.has_objects_for_region(SubdomainId(0)));

    warehouse.add_object(&[SubdomainId(1), SubdomainId(2)], named_kernel("k"));
    assert_eq!(warehouse.len(), 1);
    assert!(warehouse.has_objects_for_region(SubdomainId(1)));
    assert!(warehouse.has_objects_for_region(SubdomainId(2)));
    assert!(!warehouse.has_objects_for_region(SubdomainId(0)));
    assert_eq!(
        warehouse.all_regions().into_iter().collect::<Vec<_>>(),
        [SubdomainId(1), SubdomainId(2)]
    );

    // The master list holds multi-region objects exactly once.
    assert_eq!(warehouse.objects().len(), 1);
}

#[test]
fn master_list_mixes_kernel_kinds_in_registration_order() {
    let mut warehouse: Warehouse<SubdomainId, dyn Kernel<f64>> = Warehouse::default();
    warehouse.add_object(
        &[],
        Arc::new(TimeDerivativeKernel {
            name: "dudt".to_string(),
        }),
    );
    warehouse.add_object(&[], named_kernel("diff"));
    let names: Vec<_> = warehouse
        .objects()
        .iter()
        .map(|object| object.name().to_string())
        .collect();
    assert_eq!(names, ["dudt", "diff"]);
}
