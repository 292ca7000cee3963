//! Registration and activity lookup for physics objects.
//!
//! Loop bodies never scan all registered objects per element; they fetch the
//! precomputed index list for the subdomain or boundary at hand, typically
//! caching it across a subdomain transition.

use crate::materials::PropertyId;
use crate::mesh::{BoundaryId, Mesh, SubdomainId};
use crate::physics::{
    Damper, DgKernel, ElementUserObject, Indicator, IntegratedBc, InterfaceKernel, Kernel, Marker,
    Material, NodalKernel, PhysicsObject,
};
use crate::system::VariableId;
use rustc_hash::FxHashMap;

/// Insertion-ordered id set built by the dependency queries at subdomain
/// transitions.
///
/// Dependency sets stay small (a handful of variables or properties), so
/// membership is a linear scan over a plain vector.
#[derive(Debug, Clone, Default)]
pub struct DependencySet<T> {
    members: Vec<T>,
}

impl<T: Copy + PartialEq> DependencySet<T> {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    pub fn insert(&mut self, member: T) {
        if !self.members.contains(&member) {
            self.members.push(member);
        }
    }

    pub fn contains(&self, member: T) -> bool {
        self.members.contains(&member)
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.members.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Objects of one kind together with their activity lists.
///
/// [`Warehouse::finalize`] expands each object's restriction against the
/// mesh population: a subdomain-restricted object lands on the lists it
/// names, an object with no restriction at all lands on every subdomain
/// list, and a boundary-restricted object lands only on its boundary lists.
/// Queries return index slices so callers can hold them without allocating.
pub struct Warehouse<T: ?Sized> {
    objects: Vec<Box<T>>,
    by_subdomain: FxHashMap<SubdomainId, Vec<u32>>,
    by_boundary: FxHashMap<BoundaryId, Vec<u32>>,
}

impl<T: ?Sized> Default for Warehouse<T> {
    fn default() -> Self {
        Self {
            objects: Vec::new(),
            by_subdomain: FxHashMap::default(),
            by_boundary: FxHashMap::default(),
        }
    }
}

impl<T: PhysicsObject + ?Sized> Warehouse<T> {
    pub fn add(&mut self, object: Box<T>) -> u32 {
        self.objects.push(object);
        (self.objects.len() - 1) as u32
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn object(&self, index: u32) -> &T {
        &self.objects[index as usize]
    }

    pub fn objects(&self) -> impl Iterator<Item = &T> {
        self.objects.iter().map(|object| &**object)
    }

    pub fn finalize(&mut self, subdomains: &[SubdomainId], _boundaries: &[BoundaryId]) {
        self.by_subdomain.clear();
        self.by_boundary.clear();
        for (index, object) in self.objects.iter().enumerate() {
            let index = index as u32;
            match object.subdomains() {
                Some(restricted) => {
                    for &subdomain in restricted {
                        self.by_subdomain.entry(subdomain).or_default().push(index);
                    }
                }
                // Unrestricted volume objects are active everywhere, but a
                // boundary restriction marks the object as a boundary
                // object, not a volume object on all subdomains.
                None if object.boundaries().is_none() => {
                    for &subdomain in subdomains {
                        self.by_subdomain.entry(subdomain).or_default().push(index);
                    }
                }
                None => {}
            }
            if let Some(restricted) = object.boundaries() {
                for &boundary in restricted {
                    self.by_boundary.entry(boundary).or_default().push(index);
                }
            }
        }
    }

    pub fn active_on_subdomain(&self, subdomain: SubdomainId) -> &[u32] {
        self.by_subdomain
            .get(&subdomain)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn active_on_boundary(&self, boundary: BoundaryId) -> &[u32] {
        self.by_boundary
            .get(&boundary)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Union the declared variable couplings of the given active objects
    /// into `needed`. Role-implied variables, such as a kernel's own
    /// variable, are added by the caller, which knows the role.
    pub fn update_variable_dependency(
        &self,
        active: &[u32],
        needed: &mut DependencySet<VariableId>,
    ) {
        for &index in active {
            for &var in self.objects[index as usize].coupled_variables() {
                needed.insert(var);
            }
        }
    }

    /// Union the declared material property reads of the given active
    /// objects into `needed`.
    pub fn update_matprop_dependency(&self, active: &[u32], needed: &mut DependencySet<PropertyId>) {
        for &index in active {
            for &prop in self.objects[index as usize].material_properties() {
                needed.insert(prop);
            }
        }
    }

    /// [`Warehouse::update_variable_dependency`] over every registered
    /// object. Boundary-keyed warehouses contribute all of their objects at
    /// a subdomain transition, because any tagged side may appear inside
    /// the subdomain.
    pub fn update_boundary_variable_dependency(&self, needed: &mut DependencySet<VariableId>) {
        for object in &self.objects {
            for &var in object.coupled_variables() {
                needed.insert(var);
            }
        }
    }

    /// [`Warehouse::update_matprop_dependency`] over every registered
    /// object.
    pub fn update_boundary_matprop_dependency(&self, needed: &mut DependencySet<PropertyId>) {
        for object in &self.objects {
            for &prop in object.material_properties() {
                needed.insert(prop);
            }
        }
    }
}

/// Central registration point for the physics objects and material
/// properties of a problem.
///
/// After registration, [`Registry::finalize`] must run once against the
/// mesh (and again whenever refinement or retagging changes the subdomain
/// or boundary population) before any traversal queries activity.
#[derive(Default)]
pub struct Registry {
    kernels: Warehouse<dyn Kernel>,
    integrated_bcs: Warehouse<dyn IntegratedBc>,
    dg_kernels: Warehouse<dyn DgKernel>,
    interface_kernels: Warehouse<dyn InterfaceKernel>,
    nodal_kernels: Warehouse<dyn NodalKernel>,
    indicators: Warehouse<dyn Indicator>,
    markers: Warehouse<dyn Marker>,
    dampers: Warehouse<dyn Damper>,
    user_objects: Warehouse<dyn ElementUserObject>,
    materials: Warehouse<dyn Material>,
    properties: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named material property slot, or look up its id if the
    /// name is already taken.
    pub fn register_property(&mut self, name: impl Into<String>) -> PropertyId {
        let name = name.into();
        if let Some(position) = self.properties.iter().position(|p| *p == name) {
            return PropertyId(position as u32);
        }
        self.properties.push(name);
        PropertyId((self.properties.len() - 1) as u32)
    }

    pub fn num_properties(&self) -> usize {
        self.properties.len()
    }

    pub fn property_id(&self, name: &str) -> Option<PropertyId> {
        self.properties
            .iter()
            .position(|p| p == name)
            .map(|i| PropertyId(i as u32))
    }

    pub fn property_name(&self, id: PropertyId) -> &str {
        &self.properties[id.0 as usize]
    }

    pub fn add_kernel(&mut self, kernel: impl Kernel + 'static) {
        self.kernels.add(Box::new(kernel));
    }

    pub fn add_integrated_bc(&mut self, bc: impl IntegratedBc + 'static) {
        self.integrated_bcs.add(Box::new(bc));
    }

    pub fn add_dg_kernel(&mut self, kernel: impl DgKernel + 'static) {
        self.dg_kernels.add(Box::new(kernel));
    }

    pub fn add_interface_kernel(&mut self, kernel: impl InterfaceKernel + 'static) {
        self.interface_kernels.add(Box::new(kernel));
    }

    pub fn add_nodal_kernel(&mut self, kernel: impl NodalKernel + 'static) {
        self.nodal_kernels.add(Box::new(kernel));
    }

    pub fn add_indicator(&mut self, indicator: impl Indicator + 'static) {
        self.indicators.add(Box::new(indicator));
    }

    pub fn add_marker(&mut self, marker: impl Marker + 'static) {
        self.markers.add(Box::new(marker));
    }

    pub fn add_damper(&mut self, damper: impl Damper + 'static) {
        self.dampers.add(Box::new(damper));
    }

    pub fn add_user_object(&mut self, user_object: impl ElementUserObject + 'static) {
        self.user_objects.add(Box::new(user_object));
    }

    pub fn add_material(&mut self, material: impl Material + 'static) {
        self.materials.add(Box::new(material));
    }

    pub fn kernels(&self) -> &Warehouse<dyn Kernel> {
        &self.kernels
    }

    pub fn integrated_bcs(&self) -> &Warehouse<dyn IntegratedBc> {
        &self.integrated_bcs
    }

    pub fn dg_kernels(&self) -> &Warehouse<dyn DgKernel> {
        &self.dg_kernels
    }

    pub fn interface_kernels(&self) -> &Warehouse<dyn InterfaceKernel> {
        &self.interface_kernels
    }

    pub fn nodal_kernels(&self) -> &Warehouse<dyn NodalKernel> {
        &self.nodal_kernels
    }

    pub fn indicators(&self) -> &Warehouse<dyn Indicator> {
        &self.indicators
    }

    pub fn markers(&self) -> &Warehouse<dyn Marker> {
        &self.markers
    }

    pub fn dampers(&self) -> &Warehouse<dyn Damper> {
        &self.dampers
    }

    pub fn user_objects(&self) -> &Warehouse<dyn ElementUserObject> {
        &self.user_objects
    }

    pub fn materials(&self) -> &Warehouse<dyn Material> {
        &self.materials
    }

    /// Rebuild every warehouse's activity lists against the current mesh.
    pub fn finalize(&mut self, mesh: &Mesh) {
        let subdomains = mesh.subdomain_ids();
        let boundaries = mesh.all_boundary_ids();
        self.kernels.finalize(&subdomains, &boundaries);
        self.integrated_bcs.finalize(&subdomains, &boundaries);
        self.dg_kernels.finalize(&subdomains, &boundaries);
        self.interface_kernels.finalize(&subdomains, &boundaries);
        self.nodal_kernels.finalize(&subdomains, &boundaries);
        self.indicators.finalize(&subdomains, &boundaries);
        self.markers.finalize(&subdomains, &boundaries);
        self.dampers.finalize(&subdomains, &boundaries);
        self.user_objects.finalize(&subdomains, &boundaries);
        self.materials.finalize(&subdomains, &boundaries);
    }
}
