use super::object::{Obj, ObjClosure, ObjFunction, ObjKind, ObjNative, ObjString, ObjUpvalue};
use super::table::{hash_string, Table};
use super::value::Value;

const GC_HEAP_GROW_FACTOR: usize = 2;
const GC_FIRST_THRESHOLD: usize = 1024 * 1024;

/// Handle into the heap's slot arena. Handles compare by index, which makes
/// value identity and interned string equality the same test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gc(usize);

/// The managed object heap. The slot arena is the entire allocated universe:
/// the collector frees unreachable slots and reuses them for later
/// allocations. The intern table holds its keys weakly.
pub struct Heap {
    slots: Vec<Option<Obj>>,
    free: Vec<usize>,
    strings: Table,
    gray: Vec<Gc>,
    pub(crate) bytes_allocated: usize,
    pub(crate) next_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: GC_FIRST_THRESHOLD,
        }
    }

    pub fn alloc(&mut self, kind: ObjKind) -> Gc {
        let obj = Obj::new(kind);
        self.bytes_allocated += obj.size;

        let gc = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(obj);
                Gc(idx)
            }
            None => {
                self.slots.push(Some(obj));
                Gc(self.slots.len() - 1)
            }
        };

        if cfg!(feature = "debug-gc") {
            eprintln!("{:?} allocate {} bytes", gc, self.get(gc).size);
        }

        gc
    }

    pub fn intern(&mut self, chars: &str) -> Gc {
        let hash = hash_string(chars);
        if let Some(gc) = self.find_string(chars, hash) {
            return gc;
        }
        let gc = self.alloc(ObjKind::String(ObjString {
            chars: chars.to_owned(),
            hash,
        }));
        self.strings.set(gc, hash, Value::Nil);
        gc
    }

    pub fn find_string(&self, chars: &str, hash: u32) -> Option<Gc> {
        self.strings
            .find_string(chars, hash, |gc| self.string(gc).chars.as_str())
    }

    fn get(&self, gc: Gc) -> &Obj {
        self.slots[gc.0].as_ref().unwrap()
    }

    fn get_mut(&mut self, gc: Gc) -> &mut Obj {
        self.slots[gc.0].as_mut().unwrap()
    }

    //>> Typed accessors. The compiler and VM only hand out handles whose
    //>> variant they know, so a mismatch is a bug, not an error.
    pub fn string(&self, gc: Gc) -> &ObjString {
        match &self.get(gc).kind {
            ObjKind::String(s) => s,
            _ => unreachable!(),
        }
    }

    pub fn function(&self, gc: Gc) -> &ObjFunction {
        match &self.get(gc).kind {
            ObjKind::Function(f) => f,
            _ => unreachable!(),
        }
    }

    pub fn closure(&self, gc: Gc) -> &ObjClosure {
        match &self.get(gc).kind {
            ObjKind::Closure(c) => c,
            _ => unreachable!(),
        }
    }

    pub fn closure_mut(&mut self, gc: Gc) -> &mut ObjClosure {
        match &mut self.get_mut(gc).kind {
            ObjKind::Closure(c) => c,
            _ => unreachable!(),
        }
    }

    pub fn upvalue(&self, gc: Gc) -> &ObjUpvalue {
        match &self.get(gc).kind {
            ObjKind::Upvalue(u) => u,
            _ => unreachable!(),
        }
    }

    pub fn upvalue_mut(&mut self, gc: Gc) -> &mut ObjUpvalue {
        match &mut self.get_mut(gc).kind {
            ObjKind::Upvalue(u) => u,
            _ => unreachable!(),
        }
    }

    pub fn native(&self, gc: Gc) -> &ObjNative {
        match &self.get(gc).kind {
            ObjKind::Native(n) => n,
            _ => unreachable!(),
        }
    }

    pub fn kind(&self, gc: Gc) -> &ObjKind {
        &self.get(gc).kind
    }
    //<<

    pub fn display(&self, value: Value) -> String {
        match value {
            Value::Bool(b) => b.to_string(),
            Value::Nil => "nil".to_owned(),
            Value::Number(n) => format_number(n),
            Value::Obj(gc) => match &self.get(gc).kind {
                ObjKind::String(s) => s.chars.clone(),
                ObjKind::Function(f) => self.function_name(f.name),
                ObjKind::Closure(c) => self.function_name(self.function(c.function).name),
                ObjKind::Upvalue(_) => "upvalue".to_owned(),
                ObjKind::Native(_) => "<native fn>".to_owned(),
            },
        }
    }

    fn function_name(&self, name: Option<Gc>) -> String {
        match name {
            Some(name) => format!("<fn {}>", self.string(name).chars),
            None => "<script>".to_owned(),
        }
    }

    pub(crate) fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    //>> Collection phases, driven by the VM which knows the roots.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(gc) = value {
            self.mark_object(gc);
        }
    }

    pub fn mark_object(&mut self, gc: Gc) {
        let obj = self.get_mut(gc);
        if obj.marked {
            return;
        }
        obj.marked = true;
        self.gray.push(gc);
    }

    pub fn trace_references(&mut self) {
        while let Some(gc) = self.gray.pop() {
            self.blacken(gc);
        }
    }

    fn blacken(&mut self, gc: Gc) {
        let mut objects = Vec::new();
        let mut values = Vec::new();

        match &self.get(gc).kind {
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Upvalue(upvalue) => {
                if let ObjUpvalue::Closed(value) = upvalue {
                    values.push(*value);
                }
            }
            ObjKind::Function(function) => {
                if let Some(name) = function.name {
                    objects.push(name);
                }
                values.extend_from_slice(function.chunk.constants());
            }
            ObjKind::Closure(closure) => {
                objects.push(closure.function);
                objects.extend_from_slice(&closure.upvalues);
            }
        }

        for object in objects {
            self.mark_object(object);
        }
        for value in values {
            self.mark_value(value);
        }
    }

    /// Drops intern entries whose key did not survive marking.
    pub fn remove_white_strings(&mut self) {
        let Heap { strings, slots, .. } = self;
        strings.remove_white(|gc| slots[gc.0].as_ref().map_or(false, |obj| obj.marked));
    }

    pub fn sweep(&mut self) {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(obj) if obj.marked => obj.marked = false,
                Some(obj) => {
                    if cfg!(feature = "debug-gc") {
                        eprintln!("Gc({}) free {} bytes", idx, obj.size);
                    }
                    self.bytes_allocated -= obj.size;
                    *slot = None;
                    self.free.push(idx);
                }
                None => {}
            }
        }
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
    }
    //<<
}

fn format_number(n: f64) -> String {
    if n.is_infinite() {
        if n > 0.0 {
            "inf".to_owned()
        } else {
            "-inf".to_owned()
        }
    } else if n.is_nan() {
        "nan".to_owned()
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_one_handle_per_content() {
        let mut heap = Heap::new();
        let a = heap.intern("foo");
        let b = heap.intern("foo");
        let c = heap.intern("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.live_objects(), 2);
    }

    #[test]
    fn unreachable_objects_are_swept_and_slots_reused() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        heap.intern("garbage");
        let before = heap.bytes_allocated;

        heap.mark_object(kept);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        assert_eq!(heap.live_objects(), 1);
        assert!(heap.bytes_allocated < before);
        assert_eq!(heap.string(kept).chars, "kept");
        assert_eq!(
            heap.find_string("garbage", hash_string("garbage")),
            None
        );

        // the freed slot is handed back out
        let reborn = heap.intern("reborn");
        assert_eq!(heap.live_objects(), 2);
        assert_eq!(heap.string(reborn).chars, "reborn");
    }

    #[test]
    fn tracing_follows_closure_and_function_references() {
        let mut heap = Heap::new();
        let name = heap.intern("f");
        let constant = heap.intern("constant");
        let mut chunk = crate::chunk::Chunk::new();
        chunk.add_constant(Value::Obj(constant));
        let function = heap.alloc(ObjKind::Function(ObjFunction::new(Some(name), chunk, 0, 0)));
        let closure = heap.alloc(ObjKind::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));

        heap.mark_object(closure);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        assert_eq!(heap.live_objects(), 4);
        assert_eq!(heap.string(constant).chars, "constant");
    }

    #[test]
    fn numbers_print_like_the_source_wrote_them() {
        let heap = Heap::new();
        assert_eq!(heap.display(Value::Number(7.0)), "7");
        assert_eq!(heap.display(Value::Number(2.5)), "2.5");
        assert_eq!(heap.display(Value::Nil), "nil");
        assert_eq!(heap.display(Value::Bool(true)), "true");
    }
}
