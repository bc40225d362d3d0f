use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::Object;

#[derive(Debug, Default)]
pub struct Environment {
    store: HashMap<String, Object>,
    outer: Option<Rc<RefCell<Environment>>>,
}

impl Environment {
    pub fn new() -> Rc<RefCell<Environment>> {
        Rc::new(RefCell::new(Environment::default()))
    }

    pub fn enclosed(outer: Rc<RefCell<Environment>>) -> Rc<RefCell<Environment>> {
        Rc::new(RefCell::new(Environment {
            store: HashMap::new(),
            outer: Some(outer),
        }))
    }

    pub fn get(&self, name: &str) -> Option<Object> {
        match self.store.get(name) {
            Some(value) => Some(value.clone()),
            None => self
                .outer
                .as_ref()
                .and_then(|outer| outer.borrow().get(name)),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: Object) {
        self.store.insert(name.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_falls_back_to_outer_scope() {
        let outer = Environment::new();
        outer.borrow_mut().set("x", Object::Integer(5));

        let inner = Environment::enclosed(outer);
        assert_eq!(inner.borrow().get("x"), Some(Object::Integer(5)));
        assert_eq!(inner.borrow().get("y"), None);
    }

    #[test]
    fn inner_scope_shadows_outer() {
        let outer = Environment::new();
        outer.borrow_mut().set("x", Object::Integer(5));

        let inner = Environment::enclosed(outer.clone());
        inner.borrow_mut().set("x", Object::Integer(10));

        assert_eq!(inner.borrow().get("x"), Some(Object::Integer(10)));
        assert_eq!(outer.borrow().get("x"), Some(Object::Integer(5)));
    }
}
